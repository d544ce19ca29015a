//! Application state for the API server.

use std::sync::Arc;

use warden_engine::Supervisor;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Engine supervisor.
    pub supervisor: Arc<Supervisor>,
}

impl AppState {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }
}
