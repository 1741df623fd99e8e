//! Status poller
//!
//! Periodically refreshes every running instance from the executor. Instances
//! are refreshed concurrently; an instance whose refresh fails is logged and
//! retried on the next round.

use tokio::task::JoinSet;

use crate::service::instance_service;
use crate::state::AppState;

/// Refreshes every running instance once
///
/// Returns how many instances changed.
pub async fn poll_once(state: &AppState) -> usize {
    let mut tasks = JoinSet::new();

    for entry in state.store.entries() {
        for slot in entry.slots() {
            if !slot.snapshot().is_running() {
                continue;
            }

            let state = state.clone();
            let pipeline = entry.name().to_string();
            let id = slot.id();
            tasks.spawn(async move {
                let result = instance_service::refresh_instance(&state, &pipeline, id).await;
                (pipeline, id, result)
            });
        }
    }

    let mut changed = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, _, Ok(true))) => changed += 1,
            Ok((_, _, Ok(false))) => {}
            Ok((pipeline, id, Err(e))) => {
                tracing::warn!("Refresh of {}:{} failed: {}", pipeline, id, e);
            }
            Err(e) => tracing::error!("Refresh task panicked: {}", e),
        }
    }

    changed
}

/// Runs [`poll_once`] forever at the given period
pub async fn run(state: AppState, period: std::time::Duration) {
    tracing::info!("Status poller started (every {}s)", period.as_secs());

    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let changed = poll_once(&state).await;
        tracing::debug!("Poll round done, {} instance(s) changed", changed);
    }
}
