//! Lock-free flags shared across concurrently running jobs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Set once any job fails; never cleared for the rest of the hook run.
///
/// Clones share the same cell, so every branch of a job tree observes it.
#[derive(Debug, Clone, Default)]
pub struct FailureFlag(Arc<AtomicBool>);

impl FailureFlag {
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Caller-level cancellation. Executors poll it and kill their child process.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Underlying cell, for handlers that set it directly (signals).
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}
