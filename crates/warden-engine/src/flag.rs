//! Restart-needed flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared "the engine configuration is stale" flag.
///
/// Any number of writers may set it. It goes back to false only through
/// [`RestartFlag::take`], an atomic test-and-clear, so exactly one caller
/// observes each set.
#[derive(Debug, Clone, Default)]
pub struct RestartFlag {
    inner: Arc<AtomicBool>,
}

impl RestartFlag {
    /// Creates a cleared flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the engine as needing a restart.
    pub fn set(&self) {
        self.inner.store(true, Ordering::Release);
    }

    /// Returns whether the flag was set, clearing it.
    pub fn take(&self) -> bool {
        self.inner.swap(false, Ordering::AcqRel)
    }

    /// Reads the flag without clearing it.
    pub fn is_set(&self) -> bool {
        self.inner.load(Ordering::Acquire)
    }
}
