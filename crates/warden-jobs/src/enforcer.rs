//! Quota and expiry enforcement.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use warden_core::now_millis;
use warden_storage::{Database, Tunnel};

use crate::control::EngineControl;
use crate::scheduler::Job;

/// Disables tunnels that ran out of quota or expired, then asks for a
/// restart so the engine drops them. Never re-enables anything.
pub struct EnforcerJob<E> {
    engine: Arc<E>,
    db: Database,
}

impl<E: EngineControl> EnforcerJob<E> {
    pub fn new(engine: Arc<E>, db: Database) -> Self {
        Self { engine, db }
    }

    /// One pass at `now_ms`. Returns how many tunnels were disabled.
    pub fn enforce(&self, now_ms: i64) -> u64 {
        self.log_due(now_ms);
        match self.db.disable_invalid_tunnels(now_ms) {
            Ok(0) => 0,
            Ok(count) => {
                info!(count, "Disabled tunnels over quota or past expiry");
                self.engine.set_to_need_restart();
                count
            }
            Err(e) => {
                warn!("Failed to check tunnel quotas: {}", e);
                0
            }
        }
    }

    /// Enabled tunnels the next pass at `now_ms` will disable.
    pub fn due(&self, now_ms: i64) -> Vec<Tunnel> {
        match self.db.get_enabled_tunnels() {
            Ok(tunnels) => tunnels
                .into_iter()
                .filter(|t| t.should_disable(now_ms))
                .collect(),
            Err(e) => {
                debug!("Failed to list enabled tunnels: {}", e);
                Vec::new()
            }
        }
    }

    fn log_due(&self, now_ms: i64) {
        for t in self.due(now_ms) {
            let reason = if t.is_quota_exhausted() { "quota" } else { "expiry" };
            info!(tag = %t.tag, reason, "Disabling tunnel");
        }
    }
}

#[async_trait]
impl<E: EngineControl> Job for EnforcerJob<E> {
    fn name(&self) -> &str {
        "quota-enforcer"
    }

    async fn run(&mut self) {
        self.enforce(now_millis());
    }
}
