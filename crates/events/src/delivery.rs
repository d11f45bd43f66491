//! Per-target delivery bookkeeping.
//!
//! The change log keeps one bookkeeping record per `(event, target system)`
//! pair. The dispatch pipeline reads eligibility from these records and
//! reports outcomes back; it never adjudicates delivery state itself.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use campusidm_core::{EventId, TargetSystem};

/// Retry/eligibility thresholds governing the backfill sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityWindow {
    /// Records with `failed >= fail_limit` are excluded from sweeps until an
    /// operator intervenes. Never auto-deleted.
    pub fail_limit: u32,

    /// Minimum time a taken lease must be stale before the record is
    /// considered overdue (recovers crashed deliveries).
    pub failed_delay: Duration,

    /// Minimum age before a never-attempted event is considered overdue.
    pub unpropagated_delay: Duration,
}

impl Default for EligibilityWindow {
    fn default() -> Self {
        Self {
            fail_limit: 10,
            failed_delay: Duration::from_secs(20 * 60),
            unpropagated_delay: Duration::from_secs(90 * 60),
        }
    }
}

/// Delivery state of one `(event, target system)` pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Never attempted.
    Pending,
    /// Leased by a worker; delivery in flight (or the worker died).
    Taken,
    /// Failed at least `fail_limit` times; excluded from automatic retry.
    Failed,
}

/// Bookkeeping record for one `(event, target system)` pair.
///
/// Delivered events have no record: successful delivery removes the row.
/// `taken_time` doubles as the lease timestamp and the last-attempt marker;
/// releasing a failed attempt clears it and increments `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub event_id: EventId,
    pub target_system: TargetSystem,

    /// When the event was committed.
    pub tstamp: DateTime<Utc>,

    /// Lease timestamp; `None` when not currently taken.
    pub taken_time: Option<DateTime<Utc>>,

    /// Number of failed delivery attempts so far. Monotonically increasing
    /// (barring operator intervention).
    pub failed: u32,
}

impl DeliveryRecord {
    /// Create a fresh record for a just-committed event.
    pub fn pending(event_id: EventId, target_system: TargetSystem, tstamp: DateTime<Utc>) -> Self {
        Self {
            event_id,
            target_system,
            tstamp,
            taken_time: None,
            failed: 0,
        }
    }

    pub fn status(&self, fail_limit: u32) -> DeliveryStatus {
        if self.failed >= fail_limit {
            DeliveryStatus::Failed
        } else if self.taken_time.is_some() {
            DeliveryStatus::Taken
        } else {
            DeliveryStatus::Pending
        }
    }

    /// The backfill sweep's delivery-eligible predicate.
    ///
    /// A record qualifies when it has not yet failed permanently, and either
    /// its lease went stale (`taken_time < now - failed_delay`) or it is old
    /// enough to be overdue (`tstamp < now - unpropagated_delay`). Taken
    /// records only qualify when `include_taken` is set (recovery from
    /// collectors/workers that died mid-delivery).
    pub fn is_eligible(
        &self,
        window: &EligibilityWindow,
        include_taken: bool,
        now: DateTime<Utc>,
    ) -> bool {
        if self.failed >= window.fail_limit {
            return false;
        }
        if !include_taken && self.taken_time.is_some() {
            return false;
        }
        let failed_cutoff = now - window.failed_delay;
        let unpropagated_cutoff = now - window.unpropagated_delay;
        self.taken_time.map_or(false, |t| t < failed_cutoff) || self.tstamp < unpropagated_cutoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tstamp_age: Duration, taken_age: Option<Duration>, failed: u32) -> DeliveryRecord {
        let now = Utc::now();
        DeliveryRecord {
            event_id: EventId::new(42),
            target_system: TargetSystem::new("Exchange").unwrap(),
            tstamp: now - tstamp_age,
            taken_time: taken_age.map(|age| now - age),
            failed,
        }
    }

    fn window() -> EligibilityWindow {
        EligibilityWindow {
            fail_limit: 3,
            failed_delay: Duration::from_secs(300),
            unpropagated_delay: Duration::from_secs(600),
        }
    }

    #[test]
    fn old_unattempted_event_is_overdue() {
        let r = record(Duration::from_secs(700), None, 0);
        assert!(r.is_eligible(&window(), false, Utc::now()));
    }

    #[test]
    fn young_unattempted_event_is_not_overdue() {
        let r = record(Duration::from_secs(10), None, 0);
        assert!(!r.is_eligible(&window(), false, Utc::now()));
    }

    #[test]
    fn failed_below_limit_with_stale_lease_is_retried() {
        // failure_count=2, fail_limit=3, lease stale for 400s > 300s delay
        let r = record(Duration::from_secs(500), Some(Duration::from_secs(400)), 2);
        assert!(r.is_eligible(&window(), true, Utc::now()));
    }

    #[test]
    fn at_fail_limit_is_excluded_and_stays_excluded() {
        let r = record(Duration::from_secs(5000), Some(Duration::from_secs(4000)), 3);
        let now = Utc::now();
        assert!(!r.is_eligible(&window(), true, now));
        // Exclusion is idempotent: later sweeps see the same answer.
        assert!(!r.is_eligible(&window(), true, now + chrono::Duration::hours(6)));
        assert_eq!(r.status(3), DeliveryStatus::Failed);
    }

    #[test]
    fn taken_record_needs_include_taken() {
        let r = record(Duration::from_secs(5000), Some(Duration::from_secs(400)), 0);
        assert!(!r.is_eligible(&window(), false, Utc::now()));
        assert!(r.is_eligible(&window(), true, Utc::now()));
    }

    #[test]
    fn fresh_lease_is_left_alone() {
        let r = record(Duration::from_secs(30), Some(Duration::from_secs(5)), 0);
        assert!(!r.is_eligible(&window(), true, Utc::now()));
        assert_eq!(r.status(3), DeliveryStatus::Taken);
    }
}
