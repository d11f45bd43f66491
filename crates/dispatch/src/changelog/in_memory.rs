//! In-memory change log for tests and development.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use campusidm_core::{EventId, TargetSystem};
use campusidm_events::{DeliveryRecord, EligibilityWindow, Event};

use super::store::{ChangeLog, ChangeLogError, StuckEvent, TargetStats};

struct StoredRow {
    event: Event,
    record: DeliveryRecord,
}

/// In-memory [`ChangeLog`] with the same eligibility and bookkeeping
/// semantics as the Postgres client.
///
/// Rows are keyed by event id, so sweeps come back in commit order. The
/// `append_*` methods are seeding helpers for tests; the producing side is
/// out of scope for the pipeline.
#[derive(Default)]
pub struct InMemoryChangeLog {
    rows: RwLock<BTreeMap<EventId, StoredRow>>,
}

impl InMemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a fresh, never-attempted event for `target`.
    pub fn append_event(&self, event: Event, target: TargetSystem) {
        let record = DeliveryRecord::pending(event.id, target, event.occurred_at);
        self.append_with_record(event, record);
    }

    /// Seed an event with explicit bookkeeping state (stale leases, failure
    /// counts, ...).
    pub fn append_with_record(&self, event: Event, record: DeliveryRecord) {
        let mut rows = self.rows.write().unwrap();
        rows.insert(event.id, StoredRow { event, record });
    }

    /// Current bookkeeping state for an event, if it still exists.
    pub fn record(&self, id: EventId) -> Option<DeliveryRecord> {
        let rows = self.rows.read().unwrap();
        rows.get(&id).map(|row| row.record.clone())
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.rows.read().unwrap().contains_key(&id)
    }
}

#[async_trait]
impl ChangeLog for InMemoryChangeLog {
    async fn get_event(&self, id: EventId) -> Result<Event, ChangeLogError> {
        let rows = self.rows.read().unwrap();
        rows.get(&id)
            .map(|row| row.event.clone())
            .ok_or(ChangeLogError::NotFound(id))
    }

    async fn get_unprocessed_events(
        &self,
        target: &TargetSystem,
        window: &EligibilityWindow,
        include_taken: bool,
    ) -> Result<Vec<Event>, ChangeLogError> {
        let now = Utc::now();
        let rows = self.rows.read().unwrap();
        Ok(rows
            .values()
            .filter(|row| {
                row.record.target_system == *target
                    && row.record.is_eligible(window, include_taken, now)
            })
            .map(|row| row.event.clone())
            .collect())
    }

    async fn lock_event(&self, id: EventId, target: &TargetSystem) -> Result<bool, ChangeLogError> {
        let mut rows = self.rows.write().unwrap();
        match rows.get_mut(&id) {
            Some(row) if row.record.target_system == *target => {
                if row.record.taken_time.is_some() {
                    Ok(false)
                } else {
                    row.record.taken_time = Some(Utc::now());
                    Ok(true)
                }
            }
            _ => Ok(false),
        }
    }

    async fn release_event(
        &self,
        id: EventId,
        target: &TargetSystem,
        increment: bool,
    ) -> Result<(), ChangeLogError> {
        let mut rows = self.rows.write().unwrap();
        match rows.get_mut(&id) {
            Some(row) if row.record.target_system == *target => {
                row.record.taken_time = None;
                if increment {
                    row.record.failed += 1;
                }
                Ok(())
            }
            _ => Err(ChangeLogError::NotFound(id)),
        }
    }

    async fn remove_event(
        &self,
        id: EventId,
        target: &TargetSystem,
    ) -> Result<(), ChangeLogError> {
        let mut rows = self.rows.write().unwrap();
        match rows.get(&id) {
            Some(row) if row.record.target_system == *target => {
                rows.remove(&id);
                Ok(())
            }
            _ => Err(ChangeLogError::NotFound(id)),
        }
    }

    async fn target_stats(
        &self,
        target: &TargetSystem,
        fail_limit: u32,
    ) -> Result<TargetStats, ChangeLogError> {
        let rows = self.rows.read().unwrap();
        let mut stats = TargetStats::default();
        for row in rows.values() {
            if row.record.target_system != *target {
                continue;
            }
            stats.total += 1;
            if row.record.taken_time.is_some() {
                stats.locked += 1;
            }
            if row.record.failed >= fail_limit {
                stats.failed += 1;
            }
        }
        Ok(stats)
    }

    async fn failed_and_locked_events(
        &self,
        target: &TargetSystem,
        fail_limit: u32,
    ) -> Result<Vec<StuckEvent>, ChangeLogError> {
        let rows = self.rows.read().unwrap();
        Ok(rows
            .values()
            .filter(|row| {
                row.record.target_system == *target
                    && (row.record.failed >= fail_limit || row.record.taken_time.is_some())
            })
            .map(|row| StuckEvent {
                event_id: row.record.event_id,
                event_type: row.event.event_type.clone(),
                taken_time: row.record.taken_time,
                failed: row.record.failed,
            })
            .collect())
    }

    async fn decrement_failed_count(
        &self,
        id: EventId,
        target: &TargetSystem,
    ) -> Result<(), ChangeLogError> {
        let mut rows = self.rows.write().unwrap();
        match rows.get_mut(&id) {
            Some(row) if row.record.target_system == *target && row.record.failed > 0 => {
                row.record.failed -= 1;
                Ok(())
            }
            _ => Err(ChangeLogError::NotFound(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;

    use campusidm_core::EntityId;

    fn target() -> TargetSystem {
        TargetSystem::new("Exchange").unwrap()
    }

    fn event(id: i64, age: Duration) -> Event {
        Event::new(
            EventId::new(id),
            "account:create",
            EntityId::new(1000 + id),
            None,
            Utc::now() - age,
            json!({"uname": format!("user{id}")}),
        )
    }

    fn window() -> EligibilityWindow {
        EligibilityWindow {
            fail_limit: 3,
            failed_delay: Duration::from_secs(300),
            unpropagated_delay: Duration::from_secs(600),
        }
    }

    fn seed(
        log: &InMemoryChangeLog,
        id: i64,
        age: Duration,
        taken_age: Option<Duration>,
        failed: u32,
    ) {
        let ev = event(id, age);
        let mut record = DeliveryRecord::pending(ev.id, target(), ev.occurred_at);
        record.taken_time = taken_age.map(|a| Utc::now() - a);
        record.failed = failed;
        log.append_with_record(ev, record);
    }

    #[tokio::test]
    async fn sweep_returns_overdue_events_in_commit_order() {
        let log = InMemoryChangeLog::new();
        seed(&log, 12, Duration::from_secs(900), None, 0);
        seed(&log, 10, Duration::from_secs(800), None, 0);
        seed(&log, 11, Duration::from_secs(5), None, 0); // too young

        let events = log
            .get_unprocessed_events(&target(), &window(), true)
            .await
            .unwrap();
        let ids: Vec<i64> = events.iter().map(|e| e.id.as_i64()).collect();
        assert_eq!(ids, vec![10, 12]);
    }

    #[tokio::test]
    async fn sweep_recovers_taken_events_from_dead_runs() {
        let log = InMemoryChangeLog::new();
        // Lease from a crashed run, stale for longer than failed_delay.
        seed(&log, 7, Duration::from_secs(1000), Some(Duration::from_secs(400)), 0);

        let with_taken = log
            .get_unprocessed_events(&target(), &window(), true)
            .await
            .unwrap();
        assert_eq!(with_taken.len(), 1);

        let without_taken = log
            .get_unprocessed_events(&target(), &window(), false)
            .await
            .unwrap();
        assert!(without_taken.is_empty());
    }

    #[tokio::test]
    async fn third_failure_excludes_event_from_sweeps() {
        let log = InMemoryChangeLog::new();
        seed(&log, 42, Duration::from_secs(5000), None, 2);

        // failure_count=2 < fail_limit=3: still retried.
        let before = log
            .get_unprocessed_events(&target(), &window(), true)
            .await
            .unwrap();
        assert_eq!(before.len(), 1);

        // A third failed attempt...
        assert!(log.lock_event(EventId::new(42), &target()).await.unwrap());
        log.release_event(EventId::new(42), &target(), true)
            .await
            .unwrap();

        // ...excludes it from this and all subsequent sweeps.
        for _ in 0..3 {
            let after = log
                .get_unprocessed_events(&target(), &window(), true)
                .await
                .unwrap();
            assert!(after.is_empty());
        }
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let log = InMemoryChangeLog::new();
        seed(&log, 1, Duration::from_secs(900), None, 0);
        let id = EventId::new(1);

        assert!(log.lock_event(id, &target()).await.unwrap());
        assert!(!log.lock_event(id, &target()).await.unwrap());

        log.release_event(id, &target(), false).await.unwrap();
        assert!(log.lock_event(id, &target()).await.unwrap());
        assert_eq!(log.record(id).unwrap().failed, 0);
    }

    #[tokio::test]
    async fn remove_deletes_the_record() {
        let log = InMemoryChangeLog::new();
        seed(&log, 5, Duration::from_secs(900), None, 0);
        let id = EventId::new(5);

        log.remove_event(id, &target()).await.unwrap();
        assert!(!log.contains(id));
        assert!(matches!(
            log.get_event(id).await,
            Err(ChangeLogError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_and_locked_listing_matches_the_stats() {
        let log = InMemoryChangeLog::new();
        seed(&log, 1, Duration::from_secs(900), None, 0); // healthy
        seed(&log, 2, Duration::from_secs(900), Some(Duration::from_secs(10)), 0); // locked
        seed(&log, 3, Duration::from_secs(900), None, 3); // permanently failed

        let stuck = log.failed_and_locked_events(&target(), 3).await.unwrap();
        let ids: Vec<i64> = stuck.iter().map(|e| e.event_id.as_i64()).collect();
        assert_eq!(ids, vec![2, 3]);

        assert!(stuck[0].taken_time.is_some());
        assert_eq!(stuck[0].failed, 0);
        assert!(stuck[1].taken_time.is_none());
        assert_eq!(stuck[1].failed, 3);
    }

    #[tokio::test]
    async fn stats_and_decrement_support_operator_workflows() {
        let log = InMemoryChangeLog::new();
        seed(&log, 1, Duration::from_secs(900), None, 0);
        seed(&log, 2, Duration::from_secs(900), Some(Duration::from_secs(10)), 0);
        seed(&log, 3, Duration::from_secs(900), None, 3);

        let stats = log.target_stats(&target(), 3).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.locked, 1);
        assert_eq!(stats.failed, 1);

        // Operator gives the permanently-failed event another chance.
        log.decrement_failed_count(EventId::new(3), &target())
            .await
            .unwrap();
        let swept = log
            .get_unprocessed_events(&target(), &window(), true)
            .await
            .unwrap();
        assert!(swept.iter().any(|e| e.id.as_i64() == 3));
    }
}
