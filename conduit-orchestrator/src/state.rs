//! Shared application state

use std::sync::Arc;

use crate::executor::JobExecutor;
use crate::store::Store;

/// State shared by the HTTP handlers and the background loops
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub executor: Arc<dyn JobExecutor>,
}

impl AppState {
    pub fn new(store: Store, executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            store: Arc::new(store),
            executor,
        }
    }
}
