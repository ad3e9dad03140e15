//! Cooperative cancellation for long-running scans.
//!
//! The upgrade pass, block-index load, and contract-state pruning all poll a
//! single shared token between logical steps (per-record, per-batch); there
//! are no asynchronous primitives involved, matching the "coroutine-free
//! interrupts" design this layer uses throughout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A process-global "shutdown requested" predicate, polled at every
/// interruption point in a long-running pass.
#[derive(Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        ShutdownToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn request_shutdown(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reports progress of a long-running pass back to the caller (a UI, a log
/// line, a test harness) in whatever granularity the pass finds natural.
pub trait Progress {
    /// `percent` is in `[0, 100]`.
    fn report(&mut self, percent: u8);
}

/// A `Progress` implementation that discards every update.
impl Progress for () {
    fn report(&mut self, _percent: u8) {}
}

impl<F: FnMut(u8)> Progress for F {
    fn report(&mut self, percent: u8) {
        self(percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_starts_clear_and_latches() {
        let token = ShutdownToken::new();
        assert!(!token.is_shutdown_requested());
        token.request_shutdown();
        assert!(token.is_shutdown_requested());
    }

    #[test]
    fn token_clone_shares_state() {
        let token = ShutdownToken::new();
        let clone = token.clone();
        clone.request_shutdown();
        assert!(token.is_shutdown_requested());
    }
}
