//! Worker pool: drains the event queue and drives delivery outcomes back
//! into the change log.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use campusidm_events::Envelope;

use crate::changelog::ChangeLog;
use crate::handler::{DeliveryError, DeliveryHandler};
use crate::queue::EventQueue;
use crate::runstate::RunState;

/// Outcome counters shared by all workers in a pool. Snapshot with
/// [`WorkerStats::snapshot`] for logging or operator output.
#[derive(Debug, Default)]
pub struct WorkerStats {
    delivered: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub delivered: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// A pool of worker tasks delivering envelopes for one subscription.
///
/// Each worker runs lock, deliver, report. The change log's lock is the only
/// mutual exclusion; two workers (or two daemon instances) racing for the
/// same envelope resolve at `lock_event`, and the loser skips.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl WorkerPool {
    pub fn spawn(
        concurrency: usize,
        queue: EventQueue,
        changelog: Arc<dyn ChangeLog>,
        handler: Arc<dyn DeliveryHandler>,
        run_state: RunState,
        poll_timeout: Duration,
    ) -> Self {
        let stats = Arc::new(WorkerStats::default());
        let handles = (0..concurrency)
            .map(|worker_id| {
                let worker = Worker {
                    worker_id,
                    queue: queue.clone(),
                    changelog: Arc::clone(&changelog),
                    handler: Arc::clone(&handler),
                    run_state: run_state.clone(),
                    stats: Arc::clone(&stats),
                    poll_timeout,
                };
                tokio::spawn(worker.run())
            })
            .collect();
        Self { handles, stats }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Wait for every worker to observe the stop flag and exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task panicked");
            }
        }
        let snapshot = self.stats.snapshot();
        info!(
            delivered = snapshot.delivered,
            failed = snapshot.failed,
            skipped = snapshot.skipped,
            "worker pool drained",
        );
    }
}

struct Worker {
    worker_id: usize,
    queue: EventQueue,
    changelog: Arc<dyn ChangeLog>,
    handler: Arc<dyn DeliveryHandler>,
    run_state: RunState,
    stats: Arc<WorkerStats>,
    poll_timeout: Duration,
}

impl Worker {
    async fn run(self) {
        debug!(worker_id = self.worker_id, "worker started");
        while self.run_state.is_running() {
            if let Some(envelope) = self.queue.recv_timeout(self.poll_timeout).await {
                self.process(envelope).await;
            }
        }
        debug!(worker_id = self.worker_id, "worker stopped");
    }

    async fn process(&self, envelope: Envelope) {
        let event_id = envelope.event().id;
        let target = envelope.channel().clone();

        match self.changelog.lock_event(event_id, &target).await {
            Ok(true) => {}
            Ok(false) => {
                // Another worker owns it, or it was delivered and removed
                // between enqueue and dequeue. Both are normal.
                debug!(
                    worker_id = self.worker_id,
                    event_id = event_id.as_i64(),
                    target_system = %target,
                    "event already taken; skipping",
                );
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                // Leave the row alone; the sweep re-enqueues it later.
                warn!(
                    worker_id = self.worker_id,
                    event_id = event_id.as_i64(),
                    target_system = %target,
                    error = %e,
                    "failed to lock event",
                );
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        match self.handler.deliver(&envelope).await {
            Ok(()) => {
                if let Err(e) = self.changelog.remove_event(event_id, &target).await {
                    // The event was delivered but the record survives; the
                    // sweep will re-enqueue it and the handler must cope
                    // with the duplicate.
                    warn!(
                        worker_id = self.worker_id,
                        event_id = event_id.as_i64(),
                        target_system = %target,
                        error = %e,
                        "delivered but failed to remove record",
                    );
                }
                debug!(
                    worker_id = self.worker_id,
                    event_id = event_id.as_i64(),
                    target_system = %target,
                    "event delivered",
                );
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                match &e {
                    // Expected for handlers that only deal in a subset of
                    // event types; still counted as a failure so the record
                    // surfaces to operators instead of vanishing.
                    DeliveryError::Unsupported => debug!(
                        worker_id = self.worker_id,
                        event_id = event_id.as_i64(),
                        target_system = %target,
                        "handler does not support this event type",
                    ),
                    DeliveryError::Failed(_) => warn!(
                        worker_id = self.worker_id,
                        event_id = event_id.as_i64(),
                        target_system = %target,
                        error = %e,
                        "delivery failed",
                    ),
                }
                if let Err(e) = self.changelog.release_event(event_id, &target, true).await {
                    warn!(
                        worker_id = self.worker_id,
                        event_id = event_id.as_i64(),
                        target_system = %target,
                        error = %e,
                        "failed to release event after failed delivery",
                    );
                }
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::Mutex;

    use async_trait::async_trait;
    use campusidm_core::{EntityId, EventId, TargetSystem};
    use campusidm_events::Event;

    use crate::changelog::InMemoryChangeLog;
    use crate::handler::DeliveryError;

    fn target() -> TargetSystem {
        TargetSystem::new("AD").unwrap()
    }

    fn event(id: i64) -> Event {
        Event::new(
            EventId::new(id),
            "account:create",
            EntityId::new(1000 + id),
            None,
            Utc::now(),
            json!({}),
        )
    }

    /// Records every envelope it sees; configurable failure budget.
    struct RecordingHandler {
        seen: Mutex<Vec<i64>>,
        fail_first: AtomicU64,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                fail_first: AtomicU64::new(0),
            })
        }

        fn failing_first(n: u64) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                fail_first: AtomicU64::new(n),
            })
        }
    }

    #[async_trait]
    impl DeliveryHandler for RecordingHandler {
        async fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
            self.seen.lock().await.push(envelope.event().id.as_i64());
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DeliveryError::Failed("simulated outage".to_string()));
            }
            Ok(())
        }
    }

    async fn drain(pool: WorkerPool, run_state: &RunState) -> WorkerStatsSnapshot {
        tokio::time::sleep(Duration::from_millis(50)).await;
        run_state.stop();
        let stats = pool.stats();
        pool.join().await;
        stats.snapshot()
    }

    fn spawn_pool(
        concurrency: usize,
        queue: &EventQueue,
        log: &Arc<InMemoryChangeLog>,
        handler: Arc<dyn DeliveryHandler>,
        run_state: &RunState,
    ) -> WorkerPool {
        WorkerPool::spawn(
            concurrency,
            queue.clone(),
            Arc::clone(log) as Arc<dyn ChangeLog>,
            handler,
            run_state.clone(),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn successful_delivery_removes_record() {
        let log = Arc::new(InMemoryChangeLog::new());
        log.append_event(event(1), target());
        let queue = EventQueue::unbounded();
        let run_state = RunState::new();
        let handler = RecordingHandler::new();

        let pool = spawn_pool(1, &queue, &log, handler.clone(), &run_state);
        queue
            .push(Envelope::new(target(), event(1)))
            .await
            .unwrap();

        let stats = drain(pool, &run_state).await;
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.failed, 0);
        assert!(!log.contains(EventId::new(1)));
        assert_eq!(*handler.seen.lock().await, vec![1]);
    }

    #[tokio::test]
    async fn failed_delivery_releases_and_increments() {
        let log = Arc::new(InMemoryChangeLog::new());
        log.append_event(event(2), target());
        let queue = EventQueue::unbounded();
        let run_state = RunState::new();
        let handler = RecordingHandler::failing_first(1);

        let pool = spawn_pool(1, &queue, &log, handler, &run_state);
        queue
            .push(Envelope::new(target(), event(2)))
            .await
            .unwrap();

        let stats = drain(pool, &run_state).await;
        assert_eq!(stats.failed, 1);

        let record = log.record(EventId::new(2)).unwrap();
        assert_eq!(record.failed, 1);
        assert!(record.taken_time.is_none());
        assert!(log.contains(EventId::new(2)));
    }

    #[tokio::test]
    async fn unsupported_event_counts_as_failure() {
        struct Rejecting;

        #[async_trait]
        impl DeliveryHandler for Rejecting {
            async fn deliver(&self, _: &Envelope) -> Result<(), DeliveryError> {
                Err(DeliveryError::Unsupported)
            }
        }

        let log = Arc::new(InMemoryChangeLog::new());
        log.append_event(event(9), target());
        let queue = EventQueue::unbounded();
        let run_state = RunState::new();

        let pool = spawn_pool(1, &queue, &log, Arc::new(Rejecting), &run_state);
        queue
            .push(Envelope::new(target(), event(9)))
            .await
            .unwrap();

        let stats = drain(pool, &run_state).await;
        assert_eq!(stats.failed, 1);

        let record = log.record(EventId::new(9)).unwrap();
        assert_eq!(record.failed, 1);
        assert!(record.taken_time.is_none());
    }

    #[tokio::test]
    async fn duplicate_envelope_is_skipped_by_lock() {
        let log = Arc::new(InMemoryChangeLog::new());
        log.append_event(event(3), target());
        let queue = EventQueue::unbounded();
        let run_state = RunState::new();
        let handler = RecordingHandler::new();

        // The same event enqueued twice (live path and sweep overlapping).
        let pool = spawn_pool(2, &queue, &log, handler.clone(), &run_state);
        queue
            .push(Envelope::new(target(), event(3)))
            .await
            .unwrap();
        queue
            .push(Envelope::new(target(), event(3)))
            .await
            .unwrap();

        let stats = drain(pool, &run_state).await;
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(*handler.seen.lock().await, vec![3]);
    }

    #[tokio::test]
    async fn pool_drains_backlog_across_workers() {
        let log = Arc::new(InMemoryChangeLog::new());
        let queue = EventQueue::unbounded();
        let run_state = RunState::new();
        let handler = RecordingHandler::new();

        for id in 1..=20 {
            log.append_event(event(id), target());
        }
        let pool = spawn_pool(4, &queue, &log, handler.clone(), &run_state);
        for id in 1..=20 {
            queue
                .push(Envelope::new(target(), event(id)))
                .await
                .unwrap();
        }

        let stats = drain(pool, &run_state).await;
        assert_eq!(stats.delivered, 20);
        let mut seen = handler.seen.lock().await.clone();
        seen.sort_unstable();
        assert_eq!(seen, (1..=20).collect::<Vec<_>>());
    }
}
