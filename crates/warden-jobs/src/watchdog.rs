//! Engine liveness watchdog.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::control::EngineControl;
use crate::scheduler::Job;

/// Consecutive failed checks before a restart is requested.
pub const FAILURE_THRESHOLD: u32 = 2;

/// Watchdog state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    /// Last check saw the engine running.
    Healthy,
    /// One or more consecutive checks saw it down.
    Suspect,
}

/// Requests a restart once the engine has been down for
/// [`FAILURE_THRESHOLD`] consecutive checks.
///
/// A single miss is tolerated: the engine may be mid-restart already.
pub struct WatchdogJob<E> {
    engine: Arc<E>,
    failures: u32,
}

impl<E: EngineControl> WatchdogJob<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            engine,
            failures: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> WatchdogState {
        if self.failures == 0 {
            WatchdogState::Healthy
        } else {
            WatchdogState::Suspect
        }
    }

    /// Consecutive failed checks so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// One liveness check.
    pub fn check(&mut self) {
        if self.engine.is_running() {
            if self.failures > 0 {
                debug!(failures = self.failures, "Engine is running again");
            }
            self.failures = 0;
            return;
        }

        self.failures += 1;
        if self.failures < FAILURE_THRESHOLD {
            debug!(failures = self.failures, "Engine not running");
            return;
        }

        warn!(failures = self.failures, "Engine not running, requesting restart");
        self.engine.set_to_need_restart();
    }
}

#[async_trait]
impl<E: EngineControl> Job for WatchdogJob<E> {
    fn name(&self) -> &str {
        "engine-watchdog"
    }

    async fn run(&mut self) {
        self.check();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::fake::FakeEngine;

    fn run_checks(checks: &[bool]) -> (WatchdogJob<FakeEngine>, Arc<FakeEngine>) {
        let engine = Arc::new(FakeEngine::with_liveness(checks));
        let mut job = WatchdogJob::new(engine.clone());
        for _ in checks {
            job.check();
        }
        (job, engine)
    }

    #[test]
    fn second_consecutive_failure_requests_restart() {
        let (job, engine) = run_checks(&[true, false, false]);
        assert_eq!(engine.restart_requests(), 1);
        assert_eq!(job.state(), WatchdogState::Suspect);
    }

    #[test]
    fn interrupted_failures_do_not_request_restart() {
        let (job, engine) = run_checks(&[false, true, false]);
        assert_eq!(engine.restart_requests(), 0);
        assert_eq!(job.failures(), 1);
    }

    #[test]
    fn stays_suspect_until_success() {
        let (job, engine) = run_checks(&[false, false, false, false]);
        assert_eq!(engine.restart_requests(), 3);
        assert_eq!(job.state(), WatchdogState::Suspect);

        let (job, _) = run_checks(&[false, false, true]);
        assert_eq!(job.state(), WatchdogState::Healthy);
    }

    #[test]
    fn healthy_engine_is_left_alone() {
        let (job, engine) = run_checks(&[true, true, true]);
        assert_eq!(engine.restart_requests(), 0);
        assert_eq!(job.state(), WatchdogState::Healthy);
    }
}
