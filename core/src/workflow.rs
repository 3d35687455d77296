//! Table-driven document workflow.
//!
//! States and transitions are configuration rows, not code. A
//! [`WorkflowDefinition`] is loaded once (from the store, or from
//! [`WorkflowDefinition::standard`]) and validated; afterwards every transition
//! decision is a pure function of *(entity kind, origin, destination, roles,
//! comment)*, shared by all three document kinds.
//!
//! ```text
//! master waybill     available ──► assigned ──► available (compensation)
//!                        └──► voided
//!
//! coordination       created ──► coordinated ──► cut
//!                       │  └─────────────────────► cut
//!                       └──► cancelled ◄── coordinated
//!
//! child waybill      registered ◄──► confirmed
//!                        └──► cancelled ◄──┘
//! ```

use crate::constants::{child_states, coordination_states, master_states, roles};
use crate::types::{ActorId, HistoryId, Role, RoleSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

/// Identifier of a configured state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(pub i64);

impl StateId {
    /// Wrap a raw store key.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// The raw store key.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three document kinds sharing the workflow engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// Master waybill (guía madre).
    MasterWaybill,
    /// Coordination record (documento de coordinación).
    Coordination,
    /// Child waybill (guía hija).
    ChildWaybill,
}

impl EntityKind {
    /// Every entity kind.
    pub const ALL: [Self; 3] = [Self::MasterWaybill, Self::Coordination, Self::ChildWaybill];

    /// Store representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MasterWaybill => "master_waybill",
            Self::Coordination => "coordination",
            Self::ChildWaybill => "child_waybill",
        }
    }

    /// Parse the store representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "master_waybill" => Some(Self::MasterWaybill),
            "coordination" => Some(Self::Coordination),
            "child_waybill" => Some(Self::ChildWaybill),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDefinition {
    /// Store key.
    pub id: StateId,
    /// Stable name services resolve the state by.
    pub name: String,
    /// Kind this state belongs to.
    pub entity_kind: EntityKind,
    /// Entry state for new entities; one per kind.
    pub is_initial: bool,
    /// Terminal state; no outgoing transitions.
    pub is_final: bool,
    /// Human description.
    pub description: Option<String>,
    /// Display color.
    pub color: Option<String>,
}

/// A configured transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionDefinition {
    /// Kind this transition belongs to.
    pub entity_kind: EntityKind,
    /// Origin state.
    pub from: StateId,
    /// Destination state.
    pub to: StateId,
    /// Roles allowed to execute it. Empty means internal-only.
    pub allowed_roles: RoleSet,
    /// Whether a non-blank comment is mandatory.
    pub requires_comment: bool,
    /// Action label shown to users.
    pub action: Option<String>,
}

impl TransitionDefinition {
    /// Whether any of `roles` may execute this transition.
    #[must_use]
    pub fn permits(&self, roles: &RoleSet) -> bool {
        !self.allowed_roles.is_disjoint(roles)
    }
}

/// Append-only audit row written by every executed transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    /// Store key.
    pub id: HistoryId,
    /// Kind of the entity.
    pub entity_kind: EntityKind,
    /// Entity key.
    pub entity_id: i64,
    /// State reached.
    pub state_id: StateId,
    /// Who performed the transition.
    pub actor_id: ActorId,
    /// Optional comment.
    pub comment: Option<String>,
    /// When it was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// History row before the store assigns its key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStateHistory {
    /// Kind of the entity.
    pub entity_kind: EntityKind,
    /// Entity key.
    pub entity_id: i64,
    /// State reached.
    pub state_id: StateId,
    /// Who performed the transition.
    pub actor_id: ActorId,
    /// Optional comment.
    pub comment: Option<String>,
    /// When it was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Why a transition request was refused by the pure decision.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRejection {
    /// No configured transition, or the role gate failed.
    #[error("transition {from} -> {to} is not allowed for {kind}")]
    Forbidden {
        /// Entity kind.
        kind: EntityKind,
        /// Requested origin.
        from: StateId,
        /// Requested destination.
        to: StateId,
    },

    /// The transition requires a comment and none was supplied.
    #[error("transition {from} -> {to} for {kind} requires a comment")]
    MissingComment {
        /// Entity kind.
        kind: EntityKind,
        /// Requested origin.
        from: StateId,
        /// Requested destination.
        to: StateId,
    },
}

/// Configuration defects found while loading a workflow definition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowConfigError {
    /// Two states share an id.
    #[error("duplicate state id {0}")]
    DuplicateState(StateId),

    /// Two states of one kind share a name.
    #[error("duplicate state name '{name}' for {kind}")]
    DuplicateStateName {
        /// Entity kind.
        kind: EntityKind,
        /// Repeated name.
        name: String,
    },

    /// A kind has zero or several initial states.
    #[error("{kind} must have exactly one initial state, found {count}")]
    InitialState {
        /// Entity kind.
        kind: EntityKind,
        /// Initial states found.
        count: usize,
    },

    /// A transition references an unknown state or a state of another kind.
    #[error("transition {from} -> {to} for {kind} references an unknown state")]
    UnknownState {
        /// Entity kind.
        kind: EntityKind,
        /// Origin.
        from: StateId,
        /// Destination.
        to: StateId,
    },

    /// Two transitions share a (kind, origin, destination) key.
    #[error("duplicate transition {from} -> {to} for {kind}")]
    DuplicateTransition {
        /// Entity kind.
        kind: EntityKind,
        /// Origin.
        from: StateId,
        /// Destination.
        to: StateId,
    },

    /// A final state has outgoing transitions.
    #[error("final state {0} has outgoing transitions")]
    FinalStateHasTransitions(StateId),

    /// A state name a service depends on is not configured.
    #[error("state '{name}' is not configured for {kind}")]
    MissingState {
        /// Entity kind.
        kind: EntityKind,
        /// Missing name.
        name: String,
    },
}

type TransitionKey = (EntityKind, StateId, StateId);

/// Validated, immutable workflow configuration.
#[derive(Clone, Debug)]
pub struct WorkflowDefinition {
    states: BTreeMap<StateId, StateDefinition>,
    transitions: HashMap<TransitionKey, TransitionDefinition>,
    initial: HashMap<EntityKind, StateId>,
}

impl WorkflowDefinition {
    /// Validate and index configuration rows.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkflowConfigError`] when the rows break an invariant:
    /// duplicate ids or names, not exactly one initial state per kind, a
    /// transition to an unknown or foreign state, a duplicate transition key,
    /// or a final state with outgoing transitions.
    pub fn new(
        states: Vec<StateDefinition>,
        transitions: Vec<TransitionDefinition>,
    ) -> Result<Self, WorkflowConfigError> {
        let mut by_id = BTreeMap::new();
        let mut names = HashMap::new();
        for state in states {
            if names
                .insert((state.entity_kind, state.name.clone()), state.id)
                .is_some()
            {
                return Err(WorkflowConfigError::DuplicateStateName {
                    kind: state.entity_kind,
                    name: state.name,
                });
            }
            let id = state.id;
            if by_id.insert(id, state).is_some() {
                return Err(WorkflowConfigError::DuplicateState(id));
            }
        }

        let mut initial = HashMap::new();
        for kind in EntityKind::ALL {
            let initials: Vec<StateId> = by_id
                .values()
                .filter(|s| s.entity_kind == kind && s.is_initial)
                .map(|s| s.id)
                .collect();
            if initials.len() != 1 {
                return Err(WorkflowConfigError::InitialState {
                    kind,
                    count: initials.len(),
                });
            }
            initial.insert(kind, initials[0]);
        }

        let mut indexed = HashMap::new();
        for transition in transitions {
            let kind = transition.entity_kind;
            let (from, to) = (transition.from, transition.to);
            let belongs = |id: StateId| by_id.get(&id).is_some_and(|s| s.entity_kind == kind);
            if !belongs(from) || !belongs(to) {
                return Err(WorkflowConfigError::UnknownState { kind, from, to });
            }
            if by_id.get(&from).is_some_and(|s| s.is_final) {
                return Err(WorkflowConfigError::FinalStateHasTransitions(from));
            }
            if indexed.insert((kind, from, to), transition).is_some() {
                return Err(WorkflowConfigError::DuplicateTransition { kind, from, to });
            }
        }

        Ok(Self {
            states: by_id,
            transitions: indexed,
            initial,
        })
    }

    /// Look up a state by id.
    #[must_use]
    pub fn state(&self, id: StateId) -> Option<&StateDefinition> {
        self.states.get(&id)
    }

    /// Look up a state of `kind` by name.
    #[must_use]
    pub fn state_named(&self, kind: EntityKind, name: &str) -> Option<&StateDefinition> {
        self.states
            .values()
            .find(|s| s.entity_kind == kind && s.name == name)
    }

    /// Resolve a state id by name.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowConfigError::MissingState`] if the name is not configured.
    pub fn require_state(&self, kind: EntityKind, name: &str) -> Result<StateId, WorkflowConfigError> {
        self.state_named(kind, name)
            .map(|s| s.id)
            .ok_or_else(|| WorkflowConfigError::MissingState {
                kind,
                name: name.to_string(),
            })
    }

    /// The initial state of `kind`.
    #[must_use]
    pub fn initial_state(&self, kind: EntityKind) -> StateId {
        // Construction guarantees one initial state per kind.
        self.initial[&kind]
    }

    /// Whether `id` is a final state.
    #[must_use]
    pub fn is_final(&self, id: StateId) -> bool {
        self.states.get(&id).is_some_and(|s| s.is_final)
    }

    /// Final states of `kind`.
    #[must_use]
    pub fn final_states(&self, kind: EntityKind) -> Vec<StateId> {
        self.states
            .values()
            .filter(|s| s.entity_kind == kind && s.is_final)
            .map(|s| s.id)
            .collect()
    }

    /// All configured states, ordered by id.
    pub fn states(&self) -> impl Iterator<Item = &StateDefinition> {
        self.states.values()
    }

    /// All configured transitions, in no particular order.
    pub fn transitions(&self) -> impl Iterator<Item = &TransitionDefinition> {
        self.transitions.values()
    }

    /// Look up the transition for a triple.
    #[must_use]
    pub fn transition(
        &self,
        kind: EntityKind,
        from: StateId,
        to: StateId,
    ) -> Option<&TransitionDefinition> {
        self.transitions.get(&(kind, from, to))
    }

    /// True iff a transition exists for the triple and, when `roles` is
    /// supplied, at least one of them is allowed on it.
    #[must_use]
    pub fn validate_transition(
        &self,
        kind: EntityKind,
        from: StateId,
        to: StateId,
        roles: Option<&RoleSet>,
    ) -> bool {
        self.transition(kind, from, to)
            .is_some_and(|t| roles.is_none_or(|r| t.permits(r)))
    }

    /// Legal next transitions from `from`, filtered by `roles` when supplied.
    #[must_use]
    pub fn transitions_from(
        &self,
        kind: EntityKind,
        from: StateId,
        roles: Option<&RoleSet>,
    ) -> Vec<&TransitionDefinition> {
        let mut legal: Vec<&TransitionDefinition> = self
            .transitions
            .values()
            .filter(|t| t.entity_kind == kind && t.from == from)
            .filter(|t| roles.is_none_or(|r| t.permits(r)))
            .collect();
        legal.sort_by_key(|t| t.to);
        legal
    }

    /// Decide whether a transition may run.
    ///
    /// A blank or whitespace-only comment counts as missing.
    ///
    /// # Errors
    ///
    /// - [`TransitionRejection::Forbidden`] if no transition matches or the role gate fails
    /// - [`TransitionRejection::MissingComment`] if a required comment is absent
    pub fn decide(
        &self,
        kind: EntityKind,
        from: StateId,
        to: StateId,
        roles: Option<&RoleSet>,
        comment: Option<&str>,
    ) -> Result<&TransitionDefinition, TransitionRejection> {
        if !self.validate_transition(kind, from, to, roles) {
            return Err(TransitionRejection::Forbidden { kind, from, to });
        }
        let transition = self
            .transition(kind, from, to)
            .ok_or(TransitionRejection::Forbidden { kind, from, to })?;

        let has_comment = comment.is_some_and(|c| !c.trim().is_empty());
        if transition.requires_comment && !has_comment {
            return Err(TransitionRejection::MissingComment { kind, from, to });
        }
        Ok(transition)
    }

    /// The seeded configuration shipped with the migrations.
    ///
    /// # Panics
    ///
    /// Never in practice: the seed rows are validated by this module's tests.
    #[must_use]
    pub fn standard() -> Self {
        let (states, transitions) = standard_rows();
        match Self::new(states, transitions) {
            Ok(definition) => definition,
            Err(error) => unreachable_seed(&error),
        }
    }
}

#[allow(clippy::panic)]
#[cold]
fn unreachable_seed(error: &WorkflowConfigError) -> ! {
    panic!("built-in workflow seed is invalid: {error}")
}

fn state(id: i64, name: &str, kind: EntityKind, is_initial: bool, is_final: bool) -> StateDefinition {
    StateDefinition {
        id: StateId::new(id),
        name: name.to_string(),
        entity_kind: kind,
        is_initial,
        is_final,
        description: None,
        color: None,
    }
}

fn transition(
    kind: EntityKind,
    from: i64,
    to: i64,
    allowed: &[&str],
    requires_comment: bool,
    action: &str,
) -> TransitionDefinition {
    TransitionDefinition {
        entity_kind: kind,
        from: StateId::new(from),
        to: StateId::new(to),
        allowed_roles: allowed.iter().map(|r| Role::new(*r)).collect(),
        requires_comment,
        action: Some(action.to_string()),
    }
}

/// Raw seed rows, identical to `postgres/migrations/0002_seed_workflow.sql`.
#[must_use]
pub fn standard_rows() -> (Vec<StateDefinition>, Vec<TransitionDefinition>) {
    use EntityKind::{ChildWaybill, Coordination, MasterWaybill};
    let (admin, coordinator, operator) = (roles::ADMIN, roles::COORDINATOR, roles::OPERATOR);

    let states = vec![
        state(1, master_states::AVAILABLE, MasterWaybill, true, false),
        state(2, master_states::ASSIGNED, MasterWaybill, false, false),
        state(3, master_states::VOIDED, MasterWaybill, false, true),
        state(10, coordination_states::CREATED, Coordination, true, false),
        state(11, coordination_states::COORDINATED, Coordination, false, false),
        state(12, coordination_states::CUT, Coordination, false, true),
        state(13, coordination_states::CANCELLED, Coordination, false, true),
        state(20, child_states::REGISTERED, ChildWaybill, true, false),
        state(21, child_states::CONFIRMED, ChildWaybill, false, false),
        state(22, child_states::CANCELLED, ChildWaybill, false, true),
    ];

    let transitions = vec![
        transition(MasterWaybill, 1, 2, &[], false, "Assign"),
        transition(MasterWaybill, 2, 1, &[], false, "Release"),
        transition(MasterWaybill, 1, 3, &[admin], true, "Void"),
        transition(Coordination, 10, 11, &[admin, coordinator], false, "Coordinate"),
        transition(Coordination, 10, 12, &[admin, coordinator], false, "Cut"),
        transition(Coordination, 11, 12, &[admin, coordinator], false, "Cut"),
        transition(Coordination, 10, 13, &[admin, coordinator], true, "Cancel"),
        transition(Coordination, 11, 13, &[admin], true, "Cancel"),
        transition(ChildWaybill, 20, 21, &[admin, coordinator, operator], false, "Confirm"),
        transition(ChildWaybill, 21, 20, &[admin], true, "Reopen"),
        transition(ChildWaybill, 20, 22, &[admin, coordinator], true, "Cancel"),
        transition(ChildWaybill, 21, 22, &[admin], true, "Cancel"),
    ];

    (states, transitions)
}
