//! The engine operations the scheduled jobs need.

use async_trait::async_trait;
use warden_core::TrafficDelta;
use warden_engine::{EngineError, Supervisor};

/// Engine operations used by the jobs.
///
/// Implemented by [`Supervisor`]; tests drive the jobs with fakes.
#[async_trait]
pub trait EngineControl: Send + Sync + 'static {
    fn is_running(&self) -> bool;

    fn set_to_need_restart(&self);

    fn is_need_restart_and_set_false(&self) -> bool;

    async fn restart(&self, silent: bool) -> Result<(), EngineError>;

    async fn pull_traffic(&self) -> Result<Vec<TrafficDelta>, EngineError>;
}

#[async_trait]
impl EngineControl for Supervisor {
    fn is_running(&self) -> bool {
        Supervisor::is_running(self)
    }

    fn set_to_need_restart(&self) {
        Supervisor::set_to_need_restart(self)
    }

    fn is_need_restart_and_set_false(&self) -> bool {
        Supervisor::is_need_restart_and_set_false(self)
    }

    async fn restart(&self, silent: bool) -> Result<(), EngineError> {
        Supervisor::restart(self, silent).await
    }

    async fn pull_traffic(&self) -> Result<Vec<TrafficDelta>, EngineError> {
        Supervisor::pull_traffic(self).await
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Scripted engine for job tests.
    #[derive(Default)]
    pub struct FakeEngine {
        pub running: AtomicBool,
        pub liveness: Mutex<VecDeque<bool>>,
        pub restart_requests: AtomicUsize,
        pub restarts: AtomicUsize,
        pub need_restart: AtomicBool,
        pub pulls: Mutex<VecDeque<Result<Vec<TrafficDelta>, EngineError>>>,
    }

    impl FakeEngine {
        pub fn running() -> Self {
            let engine = Self::default();
            engine.running.store(true, Ordering::SeqCst);
            engine
        }

        pub fn with_liveness(checks: &[bool]) -> Self {
            let engine = Self::default();
            engine.liveness.lock().extend(checks.iter().copied());
            engine
        }

        pub fn push_pull(&self, result: Result<Vec<TrafficDelta>, EngineError>) {
            self.pulls.lock().push_back(result);
        }

        pub fn restart_requests(&self) -> usize {
            self.restart_requests.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EngineControl for FakeEngine {
        fn is_running(&self) -> bool {
            match self.liveness.lock().pop_front() {
                Some(alive) => alive,
                None => self.running.load(Ordering::SeqCst),
            }
        }

        fn set_to_need_restart(&self) {
            self.restart_requests.fetch_add(1, Ordering::SeqCst);
            self.need_restart.store(true, Ordering::SeqCst);
        }

        fn is_need_restart_and_set_false(&self) -> bool {
            self.need_restart.swap(false, Ordering::SeqCst)
        }

        async fn restart(&self, _silent: bool) -> Result<(), EngineError> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn pull_traffic(&self) -> Result<Vec<TrafficDelta>, EngineError> {
            self.pulls
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }
}
