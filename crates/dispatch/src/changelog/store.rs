use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use campusidm_core::{EventId, TargetSystem};
use campusidm_events::{EligibilityWindow, Event};

/// Change log operation error.
#[derive(Debug, Error)]
pub enum ChangeLogError {
    /// No such event (or no record for the given target system).
    #[error("event {0} not found")]
    NotFound(EventId),

    /// The store is unreachable or the connection dropped. Loops recover from
    /// this locally with a fixed-delay retry; it is never fatal.
    #[error("change log connectivity: {0}")]
    Connectivity(String),

    /// A stored row could not be decoded into an event.
    #[error("malformed event record: {0}")]
    Malformed(String),

    /// Any other storage-side failure.
    #[error("change log storage: {0}")]
    Storage(String),
}

/// Per-target delivery statistics for operator inspection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TargetStats {
    /// Records currently leased (`taken_time` set).
    pub locked: i64,
    /// Records at or above the fail limit (need operator attention).
    pub failed: i64,
    /// All outstanding records for the target system.
    pub total: i64,
}

/// One event needing operator attention: permanently failed, currently
/// locked, or both.
#[derive(Debug, Clone, Serialize)]
pub struct StuckEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub taken_time: Option<DateTime<Utc>>,
    pub failed: u32,
}

/// Contract the dispatch pipeline consumes from the change log.
///
/// The store owns all delivery-state adjudication: claiming (`lock_event`),
/// retry bookkeeping (`release_event`), and completion (`remove_event`) are
/// resolved by the store's own atomicity, never by in-process locks.
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Point lookup of a committed event, used by the live collector to
    /// resolve a notification payload into the full record.
    async fn get_event(&self, id: EventId) -> Result<Event, ChangeLogError>;

    /// The backfill sweep: every event for `target` that is delivery-eligible
    /// under `window`. With `include_taken`, records leased by a run that
    /// never finished are returned as well. Results come back in event-id
    /// (commit) order.
    async fn get_unprocessed_events(
        &self,
        target: &TargetSystem,
        window: &EligibilityWindow,
        include_taken: bool,
    ) -> Result<Vec<Event>, ChangeLogError>;

    /// Claim an event for delivery. Returns `false` when the record is
    /// already taken (another worker owns it) or no longer exists.
    async fn lock_event(&self, id: EventId, target: &TargetSystem) -> Result<bool, ChangeLogError>;

    /// Report a failed attempt: clears the lease and, when `increment`,
    /// bumps the failure count so later sweeps can retry or exclude.
    async fn release_event(
        &self,
        id: EventId,
        target: &TargetSystem,
        increment: bool,
    ) -> Result<(), ChangeLogError>;

    /// Report successful delivery: removes the bookkeeping record.
    async fn remove_event(&self, id: EventId, target: &TargetSystem)
    -> Result<(), ChangeLogError>;

    /// Delivery statistics for one target system (operator tooling).
    async fn target_stats(
        &self,
        target: &TargetSystem,
        fail_limit: u32,
    ) -> Result<TargetStats, ChangeLogError>;

    /// The events behind [`target_stats`](Self::target_stats)'s `failed` and
    /// `locked` counts: permanently failed (`failed >= fail_limit`) or
    /// currently leased, in event-id order.
    async fn failed_and_locked_events(
        &self,
        target: &TargetSystem,
        fail_limit: u32,
    ) -> Result<Vec<StuckEvent>, ChangeLogError>;

    /// Operator intervention: take one failure off a record's count, making a
    /// permanently-failed event eligible for sweeps again.
    async fn decrement_failed_count(
        &self,
        id: EventId,
        target: &TargetSystem,
    ) -> Result<(), ChangeLogError>;
}
