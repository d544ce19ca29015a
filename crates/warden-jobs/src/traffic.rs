//! Traffic accounting.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use warden_storage::Database;

use crate::control::EngineControl;
use crate::scheduler::Job;

/// What one accounting tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficTick {
    /// Engine not running; nothing pulled.
    NotRunning,
    /// The pull failed; this interval goes uncounted.
    PullFailed,
    /// The engine reported no counters.
    Empty,
    /// The batch committed, updating this many tunnel rows.
    Applied(usize),
    /// The batch was rolled back.
    CommitFailed,
}

/// Pulls engine counters and folds them into the tunnel records.
///
/// Counters are pulled with reset, so a failed pull or a rolled-back batch
/// loses that interval. Under-counting is preferred to double-counting.
pub struct TrafficJob<E> {
    engine: Arc<E>,
    db: Database,
}

impl<E: EngineControl> TrafficJob<E> {
    pub fn new(engine: Arc<E>, db: Database) -> Self {
        Self { engine, db }
    }

    /// One accounting pass.
    pub async fn tick(&self) -> TrafficTick {
        if !self.engine.is_running() {
            return TrafficTick::NotRunning;
        }

        let deltas = match self.engine.pull_traffic().await {
            Ok(deltas) => deltas,
            Err(e) => {
                warn!("Failed to pull engine traffic: {}", e);
                return TrafficTick::PullFailed;
            }
        };

        if deltas.is_empty() {
            return TrafficTick::Empty;
        }

        match self.db.add_traffic(&deltas) {
            Ok(applied) => {
                debug!(deltas = deltas.len(), applied, "Traffic accounted");
                TrafficTick::Applied(applied)
            }
            Err(e) => {
                warn!("Failed to store engine traffic: {}", e);
                TrafficTick::CommitFailed
            }
        }
    }
}

#[async_trait]
impl<E: EngineControl> Job for TrafficJob<E> {
    fn name(&self) -> &str {
        "traffic-accounting"
    }

    async fn run(&mut self) {
        self.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::fake::FakeEngine;
    use warden_core::{Protocol, TrafficDelta};
    use warden_engine::EngineError;
    use warden_storage::NewTunnel;

    fn db_with_tunnels(ports: &[u16]) -> Database {
        let db = Database::in_memory().unwrap();
        for port in ports {
            db.create_tunnel(&NewTunnel::new(1, *port, Protocol::VMess))
                .unwrap();
        }
        db
    }

    fn usage(db: &Database, tag: &str) -> (i64, i64) {
        let t = db.get_tunnel_by_tag(tag).unwrap().unwrap();
        (t.up, t.down)
    }

    #[tokio::test]
    async fn skips_when_not_running() {
        let engine = Arc::new(FakeEngine::default());
        engine.push_pull(Ok(vec![TrafficDelta::inbound("inbound-1", 1, 1)]));
        let job = TrafficJob::new(engine.clone(), db_with_tunnels(&[1]));

        assert_eq!(job.tick().await, TrafficTick::NotRunning);
        // Nothing was pulled
        assert_eq!(engine.pulls.lock().len(), 1);
    }

    #[tokio::test]
    async fn applies_inbound_deltas() {
        let engine = Arc::new(FakeEngine::running());
        let db = db_with_tunnels(&[1000, 2000]);
        engine.push_pull(Ok(vec![
            TrafficDelta::inbound("inbound-1000", 10, 20),
            TrafficDelta::outbound("direct", 99, 99),
            TrafficDelta::inbound("inbound-deleted", 5, 5),
        ]));
        engine.push_pull(Ok(vec![TrafficDelta::inbound("inbound-1000", 1, 2)]));

        let job = TrafficJob::new(engine, db.clone());
        assert_eq!(job.tick().await, TrafficTick::Applied(1));
        assert_eq!(job.tick().await, TrafficTick::Applied(1));

        assert_eq!(usage(&db, "inbound-1000"), (11, 22));
        assert_eq!(usage(&db, "inbound-2000"), (0, 0));
    }

    #[tokio::test]
    async fn failed_pull_skips_tick() {
        let engine = Arc::new(FakeEngine::running());
        let db = db_with_tunnels(&[1]);
        engine.push_pull(Err(EngineError::StatsPullFailed("connection refused".into())));
        engine.push_pull(Ok(vec![TrafficDelta::inbound("inbound-1", 3, 4)]));

        let job = TrafficJob::new(engine, db.clone());
        assert_eq!(job.tick().await, TrafficTick::PullFailed);
        assert_eq!(usage(&db, "inbound-1"), (0, 0));

        // Next tick counts only its own interval
        assert_eq!(job.tick().await, TrafficTick::Applied(1));
        assert_eq!(usage(&db, "inbound-1"), (3, 4));
    }

    #[tokio::test]
    async fn empty_pull_is_noop() {
        let engine = Arc::new(FakeEngine::running());
        let job = TrafficJob::new(engine, db_with_tunnels(&[]));
        assert_eq!(job.tick().await, TrafficTick::Empty);
    }
}
