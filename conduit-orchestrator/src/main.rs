use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod config;
pub mod executor;
pub mod service;
pub mod state;
pub mod store;

use config::Config;
use service::{poller, scheduler};
use state::AppState;
use store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conduit_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Conduit Orchestrator...");

    let config = Config::from_env().context("Failed to read configuration")?;
    config.validate().context("Invalid configuration")?;

    let store = match &config.checkpoint_file {
        Some(path) if path.exists() => {
            tracing::info!("Restoring store from {}", path.display());
            Store::load(path)
                .await
                .with_context(|| format!("Failed to load checkpoint {}", path.display()))?
        }
        _ => Store::new(),
    };

    let executor = executor::from_config(&config);
    let state = AppState::new(store, executor);

    // Background loops
    tokio::spawn(poller::run(state.clone(), config.poll_interval));
    tokio::spawn(scheduler::run(state.clone(), config.scheduler_interval));
    if let Some(path) = config.checkpoint_file.clone() {
        tokio::spawn(checkpoint_loop(
            state.clone(),
            path,
            config.checkpoint_interval,
        ));
    }

    // Build router with all API endpoints
    let app = api::create_router(state.clone());

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(path) = &config.checkpoint_file {
        state
            .store
            .save(path)
            .await
            .with_context(|| format!("Failed to write final checkpoint {}", path.display()))?;
        tracing::info!("Final checkpoint written to {}", path.display());
    }

    Ok(())
}

/// Writes the store to `path` every `period`
async fn checkpoint_loop(state: AppState, path: std::path::PathBuf, period: std::time::Duration) {
    tracing::info!(
        "Checkpointing to {} every {}s",
        path.display(),
        period.as_secs()
    );

    let mut interval = tokio::time::interval(period);
    // the first tick fires immediately; nothing has changed yet
    interval.tick().await;
    loop {
        interval.tick().await;
        match state.store.save(&path).await {
            Ok(()) => tracing::debug!("Checkpoint written"),
            Err(e) => tracing::error!("Checkpoint to {} failed: {}", path.display(), e),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
