//! Cooperative shutdown flag shared by every pipeline loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

/// Process-wide run flag.
///
/// Initialized `running`; transitions to `stopped` exactly once, never
/// reversed. Every loop body reads it at least once per iteration and never
/// blocks longer than its own bounded wait, so the maximum shutdown latency
/// of a loop equals that loop's wait/sleep interval.
#[derive(Debug, Clone)]
pub struct RunState {
    running: Arc<AtomicBool>,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Request shutdown. Idempotent; only the first call logs the transition.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("run state set to stopped");
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}
