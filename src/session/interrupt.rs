//! Barge-in signalling.
//!
//! Two cooperating mechanisms: a [`CancellationToken`] aborts the current
//! turn's tasks at their suspension points, and a monotonic generation
//! counter lets every stage discard results that were computed for an
//! earlier generation. The counter tolerates the inherent race between a
//! stage completing and the interrupt arriving.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Per-session interrupt state. Shared by handle; O(1) on the control path.
#[derive(Debug)]
pub struct InterruptController {
    generation: AtomicU64,
    current: Mutex<CancellationToken>,
}

impl InterruptController {
    pub fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            current: Mutex::new(CancellationToken::new()),
        }
    }

    /// Current generation. Stages record this at start.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Token cancelling the current generation's work.
    pub fn token(&self) -> CancellationToken {
        self.current.lock().unwrap().clone()
    }

    /// Whether a stamped generation has been superseded.
    pub fn is_stale(&self, generation: u64) -> bool {
        generation != self.generation()
    }

    /// Fire a barge-in: bump the generation, cancel the old token, install
    /// a fresh one for the next turn. Returns the new generation.
    pub fn interrupt(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = {
            let mut guard = self.current.lock().unwrap();
            std::mem::replace(&mut *guard, CancellationToken::new())
        };
        previous.cancel();
        debug!(generation, "interrupt fired");
        generation
    }
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_increments() {
        let ctrl = InterruptController::new();
        assert_eq!(ctrl.generation(), 0);
        assert_eq!(ctrl.interrupt(), 1);
        assert_eq!(ctrl.interrupt(), 2);
        assert_eq!(ctrl.generation(), 2);
    }

    #[test]
    fn test_stale_detection() {
        let ctrl = InterruptController::new();
        let stamped = ctrl.generation();
        assert!(!ctrl.is_stale(stamped));
        ctrl.interrupt();
        assert!(ctrl.is_stale(stamped));
    }

    #[tokio::test]
    async fn test_interrupt_cancels_only_old_token() {
        let ctrl = InterruptController::new();
        let old = ctrl.token();
        ctrl.interrupt();
        assert!(old.is_cancelled());
        assert!(!ctrl.token().is_cancelled());
    }
}
