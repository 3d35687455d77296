//! Workflow engine: the imperative shell around [`WorkflowDefinition`].
//!
//! The definition decides; the engine loads the entity's current state under
//! lock, moves the pointer, appends the audit row, and dispatches the
//! state-changed event once the transaction commits.

use crate::dispatcher::EventDispatcher;
use std::sync::Arc;
use waybill_flow_core::environment::Clock;
use waybill_flow_core::error::{DocumentError, Result};
use waybill_flow_core::event::{DocumentEvent, StateChange};
use waybill_flow_core::store::{DocumentStore, DocumentTx};
use waybill_flow_core::types::{Actor, ChildWaybillId, RoleSet};
use waybill_flow_core::workflow::{
    EntityKind, NewStateHistory, StateHistoryEntry, StateId, TransitionDefinition,
    WorkflowDefinition,
};

/// A request to move one entity between two states.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionRequest {
    /// Kind of the entity.
    pub kind: EntityKind,
    /// Entity key.
    pub entity_id: i64,
    /// State the caller believes the entity is in.
    pub from: StateId,
    /// Requested destination.
    pub to: StateId,
    /// Who asks.
    pub actor: Actor,
    /// Optional comment; blank counts as absent.
    pub comment: Option<String>,
}

impl TransitionRequest {
    /// Build a request without a comment.
    #[must_use]
    pub const fn new(kind: EntityKind, entity_id: i64, from: StateId, to: StateId, actor: Actor) -> Self {
        Self {
            kind,
            entity_id,
            from,
            to,
            actor,
            comment: None,
        }
    }

    /// Attach a comment.
    #[must_use]
    pub fn with_comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment;
        self
    }
}

/// Executes configured transitions against a store.
pub struct WorkflowEngine<S: DocumentStore> {
    store: S,
    definition: Arc<WorkflowDefinition>,
    clock: Arc<dyn Clock>,
    dispatcher: EventDispatcher,
}

impl<S: DocumentStore> Clone for WorkflowEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            definition: Arc::clone(&self.definition),
            clock: Arc::clone(&self.clock),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<S: DocumentStore> WorkflowEngine<S> {
    /// Create an engine over an already validated definition.
    #[must_use]
    pub fn new(
        store: S,
        definition: Arc<WorkflowDefinition>,
        clock: Arc<dyn Clock>,
        dispatcher: EventDispatcher,
    ) -> Self {
        Self {
            store,
            definition,
            clock,
            dispatcher,
        }
    }

    /// Create an engine from the workflow tables held by the store.
    ///
    /// # Errors
    ///
    /// - [`DocumentError::Store`] if the tables cannot be read
    /// - [`DocumentError::WorkflowConfig`] if they are inconsistent
    pub async fn load(store: S, clock: Arc<dyn Clock>, dispatcher: EventDispatcher) -> Result<Self> {
        let rows = store.load_workflow().await?;
        let definition = WorkflowDefinition::new(rows.states, rows.transitions)?;
        tracing::info!(
            states = definition.states().count(),
            transitions = definition.transitions().count(),
            "Workflow definition loaded"
        );
        Ok(Self::new(store, Arc::new(definition), clock, dispatcher))
    }

    /// The loaded definition.
    #[must_use]
    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// The injected clock.
    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// The event dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// See [`WorkflowDefinition::validate_transition`].
    #[must_use]
    pub fn validate_transition(
        &self,
        kind: EntityKind,
        from: StateId,
        to: StateId,
        roles: Option<&RoleSet>,
    ) -> bool {
        self.definition.validate_transition(kind, from, to, roles)
    }

    /// See [`WorkflowDefinition::transitions_from`].
    #[must_use]
    pub fn transitions_from(
        &self,
        kind: EntityKind,
        from: StateId,
        roles: Option<&RoleSet>,
    ) -> Vec<&TransitionDefinition> {
        self.definition.transitions_from(kind, from, roles)
    }

    /// Execute one transition in its own transaction and dispatch the
    /// state-changed event after commit.
    ///
    /// # Errors
    ///
    /// See [`WorkflowEngine::apply`]; also [`DocumentError::Store`] if the
    /// commit fails.
    #[tracing::instrument(
        skip(self, request),
        fields(kind = %request.kind, entity_id = request.entity_id, from = %request.from, to = %request.to)
    )]
    pub async fn execute(&self, request: TransitionRequest) -> Result<StateChange> {
        let mut tx = self.store.begin().await?;
        let change = self.apply(&mut tx, &request).await?;
        let event = self.state_changed_event(&mut tx, &change).await?;
        tx.commit().await?;

        self.dispatcher.dispatch(event);
        Ok(change)
    }

    /// Execute one transition inside the caller's transaction.
    ///
    /// The definition is consulted before anything is read or written, so a
    /// refused request leaves the transaction untouched.
    ///
    /// # Errors
    ///
    /// - [`DocumentError::ForbiddenTransition`] if no transition matches or the roles do not intersect
    /// - [`DocumentError::MissingComment`] if a required comment is blank
    /// - [`DocumentError::NotFound`] if the entity does not exist
    /// - [`DocumentError::PreconditionFailed`] if the entity is not in `request.from`
    pub async fn apply(&self, tx: &mut S::Tx, request: &TransitionRequest) -> Result<StateChange> {
        let decision = self.definition.decide(
            request.kind,
            request.from,
            request.to,
            request.actor.roles.as_ref(),
            request.comment.as_deref(),
        );
        if let Err(rejection) = decision {
            metrics::counter!(crate::metrics::TRANSITIONS_REJECTED, "kind" => request.kind.as_str())
                .increment(1);
            tracing::debug!(%rejection, actor = %request.actor.id, "Transition rejected");
            return Err(rejection.into());
        }

        let current = tx
            .current_state(request.kind, request.entity_id)
            .await?
            .ok_or_else(|| DocumentError::not_found(request.kind.as_str(), request.entity_id))?;
        if current != request.from {
            return Err(DocumentError::precondition(format!(
                "{} {} is in state {}, not {}",
                request.kind,
                request.entity_id,
                self.state_name(current),
                self.state_name(request.from)
            )));
        }

        let at = self.clock.now();
        let comment = request
            .comment
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        tx.set_current_state(request.kind, request.entity_id, request.to, at)
            .await?;
        tx.append_history(NewStateHistory {
            entity_kind: request.kind,
            entity_id: request.entity_id,
            state_id: request.to,
            actor_id: request.actor.id.clone(),
            comment: comment.clone(),
            recorded_at: at,
        })
        .await?;

        metrics::counter!(crate::metrics::TRANSITIONS_EXECUTED, "kind" => request.kind.as_str())
            .increment(1);
        tracing::info!(
            kind = %request.kind,
            entity_id = request.entity_id,
            from = self.state_name(request.from),
            to = self.state_name(request.to),
            actor = %request.actor.id,
            "Transition applied"
        );

        Ok(StateChange {
            entity_kind: request.kind,
            entity_id: request.entity_id,
            from: request.from,
            to: request.to,
            actor_id: request.actor.id.clone(),
            comment,
            at,
        })
    }

    /// Build the state-changed event for a change applied in `tx`.
    ///
    /// # Errors
    ///
    /// [`DocumentError::NotFound`] if a changed child waybill vanished from `tx`.
    pub async fn state_changed_event(&self, tx: &mut S::Tx, change: &StateChange) -> Result<DocumentEvent> {
        Ok(match change.entity_kind {
            EntityKind::MasterWaybill => DocumentEvent::MasterWaybillStateChanged(change.clone()),
            EntityKind::Coordination => DocumentEvent::CoordinationStateChanged(change.clone()),
            EntityKind::ChildWaybill => {
                let child = tx
                    .get_child(ChildWaybillId::new(change.entity_id))
                    .await?
                    .ok_or_else(|| DocumentError::not_found("child_waybill", change.entity_id))?;
                DocumentEvent::ChildWaybillStateChanged {
                    change: change.clone(),
                    coordination_id: child.coordination_id,
                }
            },
        })
    }

    /// Audit trail of an entity, oldest first.
    ///
    /// # Errors
    ///
    /// [`DocumentError::Store`] if the history cannot be read.
    pub async fn history(&self, kind: EntityKind, entity_id: i64) -> Result<Vec<StateHistoryEntry>> {
        let mut tx = self.store.begin().await?;
        Ok(tx.history(kind, entity_id).await?)
    }

    fn state_name(&self, id: StateId) -> String {
        self.definition
            .state(id)
            .map_or_else(|| id.to_string(), |s| s.name.clone())
    }
}
