//! Applies requested restarts.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::control::EngineControl;
use crate::scheduler::Job;

/// Restarts the engine whenever the restart flag was set since the last
/// tick. The flag is the only trigger; this job never restarts on its own.
pub struct RestartJob<E> {
    engine: Arc<E>,
}

impl<E: EngineControl> RestartJob<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }

    /// Returns true if a restart was attempted.
    pub async fn apply(&self) -> bool {
        if !self.engine.is_need_restart_and_set_false() {
            return false;
        }

        info!("Restarting engine to apply configuration changes");
        if let Err(e) = self.engine.restart(false).await {
            error!("Engine restart failed: {}", e);
        }
        true
    }
}

#[async_trait]
impl<E: EngineControl> Job for RestartJob<E> {
    fn name(&self) -> &str {
        "engine-restart"
    }

    async fn run(&mut self) {
        self.apply().await;
    }
}
