//! Engine process interface.
//!
//! The supervisor only needs four capabilities from the engine: launch a
//! process from configuration bytes, terminate it, report its version and
//! pull traffic counters. Everything engine-specific sits behind these
//! traits so the supervisor and the scheduled tasks can be driven by fakes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use warden_core::TrafficDelta;

use crate::error::Result;

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Captured output tail and exit status as plain text.
    pub detail: String,
}

/// A launched engine process.
#[async_trait]
pub trait EngineProcess: Send + Sync {
    /// OS process id, while known.
    fn pid(&self) -> Option<u32>;

    /// Subscribes to the exit of the process.
    ///
    /// The value is `None` while the process runs and `Some` once it has
    /// exited and been reaped.
    fn exit(&self) -> watch::Receiver<Option<ProcessExit>>;

    /// Asks the process to exit, waits up to `grace`, then kills it.
    ///
    /// Returns once the process has been reaped. Calling it on a process
    /// that already exited is a no-op.
    async fn terminate(&self, grace: Duration) -> Result<()>;
}

/// The external proxy engine.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Starts a new process with the given configuration.
    async fn launch(&self, config: &[u8]) -> Result<Box<dyn EngineProcess>>;

    /// Version string of the engine binary.
    async fn version(&self) -> Result<String>;

    /// Traffic counters since the previous pull.
    async fn pull_traffic(&self) -> Result<Vec<TrafficDelta>>;
}

/// Bounded buffer of the most recent output lines of a process.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl OutputBuffer {
    /// Creates a buffer keeping at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Appends a line, evicting the oldest one when full.
    pub fn push(&self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Buffered lines joined with newlines.
    pub fn contents(&self) -> String {
        let lines = self.lines.lock();
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    /// Number of buffered lines.
    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    /// Returns true if nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_buffer_keeps_tail() {
        let buf = OutputBuffer::new(3);
        for i in 0..5 {
            buf.push(format!("line {}", i));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.contents(), "line 2\nline 3\nline 4");
    }

    #[test]
    fn output_buffer_zero_capacity() {
        let buf = OutputBuffer::new(0);
        buf.push("dropped");
        assert!(buf.is_empty());
        assert_eq!(buf.contents(), "");
    }
}
