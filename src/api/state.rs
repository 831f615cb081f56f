use crate::daemon::Daemon;
use std::sync::Arc;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub daemon: Arc<Daemon>,
}

impl AppState {
    pub fn new(daemon: Arc<Daemon>) -> Self {
        Self { daemon }
    }
}
