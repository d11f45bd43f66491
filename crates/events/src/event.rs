use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use campusidm_core::{EntityId, EventId};

/// A committed change event.
///
/// Events are **immutable facts**: created once by the change-producing side,
/// never mutated, never deleted by the dispatch pipeline. `id` is assigned
/// from a database sequence at commit time, so ids are unique and totally
/// ordered by commit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,

    /// Stable change-type identifier (e.g. "account:create", "group:add").
    pub event_type: String,

    /// The entity the change is about.
    pub subject_entity: EntityId,

    /// Secondary entity for relation changes (e.g. the group an account was
    /// added to). Absent for single-entity changes.
    pub dest_entity: Option<EntityId>,

    /// When the change was committed.
    pub occurred_at: DateTime<Utc>,

    /// Type-specific key/value payload.
    pub params: JsonValue,
}

impl Event {
    pub fn new(
        id: EventId,
        event_type: impl Into<String>,
        subject_entity: EntityId,
        dest_entity: Option<EntityId>,
        occurred_at: DateTime<Utc>,
        params: JsonValue,
    ) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            subject_entity,
            dest_entity,
            occurred_at,
            params,
        }
    }
}
