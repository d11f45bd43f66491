//! Backfill collector: the durability backstop behind the live path.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use campusidm_core::TargetSystem;
use campusidm_events::{EligibilityWindow, Envelope};

use crate::changelog::ChangeLog;
use crate::queue::{EventQueue, PushError};
use crate::runstate::RunState;

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Time between sweep cycles.
    pub run_interval: Duration,

    /// Slice length used while sleeping out `run_interval`, so the run state
    /// is re-checked at this granularity.
    pub poll_timeout: Duration,

    /// Retry/eligibility thresholds for the sweep query.
    pub window: EligibilityWindow,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            run_interval: Duration::from_secs(180),
            poll_timeout: Duration::from_secs(5),
            window: EligibilityWindow::default(),
        }
    }
}

/// Periodically sweeps the change log for events that were never delivered,
/// failed and became eligible for retry, or were taken by a run that never
/// finished, and re-enqueues them.
///
/// Each cycle queries with `include_taken` set, which is what recovers
/// envelopes owned by crashed collectors and workers. A failed cycle is
/// logged and retried after `run_interval`; it never terminates the loop.
pub struct BackfillCollector {
    target: TargetSystem,
    changelog: Arc<dyn ChangeLog>,
    queue: EventQueue,
    run_state: RunState,
    config: BackfillConfig,
}

impl BackfillCollector {
    pub fn new(
        target: TargetSystem,
        changelog: Arc<dyn ChangeLog>,
        queue: EventQueue,
        run_state: RunState,
        config: BackfillConfig,
    ) -> Self {
        Self {
            target,
            changelog,
            queue,
            run_state,
            config,
        }
    }

    pub async fn run(self) {
        info!(target_system = %self.target, "backfill collector started");

        while self.run_state.is_running() {
            self.sweep().await;
            self.sleep_out_interval().await;
        }

        info!(target_system = %self.target, "backfill collector stopped");
    }

    async fn sweep(&self) {
        match self
            .changelog
            .get_unprocessed_events(&self.target, &self.config.window, true)
            .await
        {
            Ok(events) => {
                debug!(target_system = %self.target, count = events.len(), "sweep cycle");
                for event in events {
                    if !self.enqueue(Envelope::new(self.target.clone(), event)).await {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(target_system = %self.target, error = %e, "sweep failed; retrying next cycle");
            }
        }
    }

    /// Push with bounded waits, re-checking the run state between attempts
    /// so a full queue never blocks shutdown. Returns false when the sweep
    /// should stop.
    async fn enqueue(&self, mut envelope: Envelope) -> bool {
        loop {
            if !self.run_state.is_running() {
                return false;
            }
            match self
                .queue
                .push_timeout(envelope, self.config.poll_timeout)
                .await
            {
                Ok(()) => return true,
                Err(PushError::Full(returned)) => envelope = returned,
                Err(PushError::Closed) => {
                    warn!(target_system = %self.target, "event queue closed; stopping sweep");
                    return false;
                }
            }
        }
    }

    /// Sleep `run_interval` in `poll_timeout` slices so shutdown is observed
    /// within one slice.
    async fn sleep_out_interval(&self) {
        let start = Instant::now();
        while self.run_state.is_running() {
            let elapsed = start.elapsed();
            if elapsed >= self.config.run_interval {
                break;
            }
            let remaining = self.config.run_interval - elapsed;
            sleep(remaining.min(self.config.poll_timeout)).await;
        }
    }
}
