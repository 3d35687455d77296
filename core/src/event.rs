//! Document events.
//!
//! Services emit a [`DocumentEvent`] after each committed change. Events are
//! facts: they describe what happened, carry the ids listeners need, and are
//! wrapped in an [`EventEnvelope`] with a unique id so at-least-once
//! consumers can recognise a redelivery.
//!
//! Event type names carry a version suffix (`"CoordinationCut.v1"`) so the
//! payload can evolve without breaking stored or queued envelopes.

use crate::types::{ActorId, ChildWaybillId, ConsigneeId, CoordinationId, MasterWaybillId};
use crate::workflow::{EntityKind, StateId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error types for event encoding.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize an envelope.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize an envelope.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// Subscription topic; one per [`DocumentEvent`] variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    /// A master waybill changed state.
    MasterWaybillStateChanged,
    /// A master waybill was lent to another agency.
    MasterWaybillLent,
    /// A master waybill was returned to the airline.
    MasterWaybillReturned,
    /// A coordination record changed state.
    CoordinationStateChanged,
    /// A coordination record was cut.
    CoordinationCut,
    /// A child waybill changed state.
    ChildWaybillStateChanged,
    /// A child waybill was created or re-pointed.
    ChildWaybillAssigned,
}

impl EventKind {
    /// Every topic.
    pub const ALL: [Self; 7] = [
        Self::MasterWaybillStateChanged,
        Self::MasterWaybillLent,
        Self::MasterWaybillReturned,
        Self::CoordinationStateChanged,
        Self::CoordinationCut,
        Self::ChildWaybillStateChanged,
        Self::ChildWaybillAssigned,
    ];

    /// State-change topic for an entity kind.
    #[must_use]
    pub const fn state_changed(kind: EntityKind) -> Self {
        match kind {
            EntityKind::MasterWaybill => Self::MasterWaybillStateChanged,
            EntityKind::Coordination => Self::CoordinationStateChanged,
            EntityKind::ChildWaybill => Self::ChildWaybillStateChanged,
        }
    }

    /// Versioned type name.
    #[must_use]
    pub const fn event_type(self) -> &'static str {
        match self {
            Self::MasterWaybillStateChanged => "MasterWaybillStateChanged.v1",
            Self::MasterWaybillLent => "MasterWaybillLent.v1",
            Self::MasterWaybillReturned => "MasterWaybillReturned.v1",
            Self::CoordinationStateChanged => "CoordinationStateChanged.v1",
            Self::CoordinationCut => "CoordinationCut.v1",
            Self::ChildWaybillStateChanged => "ChildWaybillStateChanged.v1",
            Self::ChildWaybillAssigned => "ChildWaybillAssigned.v1",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_type())
    }
}

/// A committed state transition, as reported by the workflow engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// Kind of the entity.
    pub entity_kind: EntityKind,
    /// Entity key.
    pub entity_id: i64,
    /// Origin state.
    pub from: StateId,
    /// Destination state.
    pub to: StateId,
    /// Who performed it.
    pub actor_id: ActorId,
    /// Comment recorded with it.
    pub comment: Option<String>,
    /// When it was recorded.
    pub at: DateTime<Utc>,
}

/// Facts emitted by document services.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DocumentEvent {
    /// A master waybill changed state.
    MasterWaybillStateChanged(StateChange),
    /// A master waybill was lent.
    MasterWaybillLent {
        /// The waybill.
        master_waybill_id: MasterWaybillId,
        /// Loan date.
        loaned_on: NaiveDate,
        /// Who lent it.
        actor_id: ActorId,
    },
    /// A master waybill was returned.
    MasterWaybillReturned {
        /// The waybill.
        master_waybill_id: MasterWaybillId,
        /// Return date.
        returned_on: NaiveDate,
        /// Who returned it.
        actor_id: ActorId,
    },
    /// A coordination record changed state.
    CoordinationStateChanged(StateChange),
    /// A coordination record was cut.
    CoordinationCut {
        /// The record.
        coordination_id: CoordinationId,
        /// Non-cancelled child waybills at cut time.
        child_count: usize,
        /// Principal consignee of the record.
        principal_consignee_id: ConsigneeId,
        /// When the cut was committed.
        cut_at: DateTime<Utc>,
    },
    /// A child waybill changed state.
    ChildWaybillStateChanged {
        /// The transition.
        change: StateChange,
        /// Owning coordination record.
        coordination_id: CoordinationId,
    },
    /// A child waybill was allocated.
    ChildWaybillAssigned {
        /// The child waybill.
        child_waybill_id: ChildWaybillId,
        /// Coordination record it now belongs to.
        coordination_id: CoordinationId,
        /// Its number.
        number: String,
        /// True when an existing child was re-used instead of created.
        reused: bool,
    },
}

impl DocumentEvent {
    /// Subscription topic of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::MasterWaybillStateChanged(_) => EventKind::MasterWaybillStateChanged,
            Self::MasterWaybillLent { .. } => EventKind::MasterWaybillLent,
            Self::MasterWaybillReturned { .. } => EventKind::MasterWaybillReturned,
            Self::CoordinationStateChanged(_) => EventKind::CoordinationStateChanged,
            Self::CoordinationCut { .. } => EventKind::CoordinationCut,
            Self::ChildWaybillStateChanged { .. } => EventKind::ChildWaybillStateChanged,
            Self::ChildWaybillAssigned { .. } => EventKind::ChildWaybillAssigned,
        }
    }

    /// Versioned type name.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        self.kind().event_type()
    }
}

/// A dispatched event with delivery metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique per dispatch.
    pub event_id: Uuid,
    /// When the event was dispatched.
    pub occurred_at: DateTime<Utc>,
    /// Payload.
    pub event: DocumentEvent,
}

impl EventEnvelope {
    /// Wrap an event with a fresh id.
    #[must_use]
    pub fn new(event: DocumentEvent, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at,
            event,
        }
    }

    /// Subscription topic of the payload.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.event.kind()
    }

    /// Encode as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if encoding fails.
    pub fn to_json(&self) -> Result<String, EventError> {
        serde_json::to_string(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Decode from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if decoding fails.
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        serde_json::from_str(json).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn state_change_topics_follow_entity_kind() {
        assert_eq!(
            EventKind::state_changed(EntityKind::ChildWaybill),
            EventKind::ChildWaybillStateChanged
        );
        assert_eq!(
            EventKind::state_changed(EntityKind::MasterWaybill).event_type(),
            "MasterWaybillStateChanged.v1"
        );
    }

    #[test]
    fn envelope_json_round_trip_keeps_identity() {
        let event = DocumentEvent::CoordinationCut {
            coordination_id: CoordinationId::new(4),
            child_count: 3,
            principal_consignee_id: ConsigneeId::new(9),
            cut_at: Utc::now(),
        };
        let envelope = EventEnvelope::new(event, Utc::now());
        let decoded = EventEnvelope::from_json(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.kind(), EventKind::CoordinationCut);
    }

    #[test]
    fn envelopes_get_distinct_ids() {
        let event = DocumentEvent::MasterWaybillLent {
            master_waybill_id: MasterWaybillId::new(1),
            loaned_on: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            actor_id: ActorId::new("ana"),
        };
        let a = EventEnvelope::new(event.clone(), Utc::now());
        let b = EventEnvelope::new(event, Utc::now());
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn rejects_garbage_json() {
        assert!(matches!(
            EventEnvelope::from_json("{"),
            Err(EventError::DeserializationError(_))
        ));
    }
}
