//! Coordination record lifecycle.
//!
//! A coordination record consumes one master waybill. Creating a record
//! assigns the waybill; cancelling it releases the waybill in the same
//! transaction, so the waybill is available exactly when no active record
//! holds it.

use crate::engine::{TransitionRequest, WorkflowEngine};
use chrono::NaiveDate;
use std::sync::Arc;
use waybill_flow_core::constants::{child_states, coordination_states, master_states};
use waybill_flow_core::error::{DocumentError, Result};
use waybill_flow_core::event::{DocumentEvent, StateChange};
use waybill_flow_core::providers::{CatalogKind, CatalogLookup};
use waybill_flow_core::store::{DocumentStore, DocumentTx};
use waybill_flow_core::types::{
    Actor, BoxSummary, Charges, ConsigneeAssignment, ConsigneeId, ConsigneeRequest,
    CoordinationId, CoordinationRecord, DestinationId, MasterWaybillId, NewCoordination,
    PaymentMode, ProductId, RoleSet, validate_consignees,
};
use waybill_flow_core::workflow::{EntityKind, NewStateHistory, StateId, TransitionDefinition};

/// Fields of a new coordination record.
#[derive(Clone, Debug, PartialEq)]
pub struct CreateCoordination {
    /// Master waybill to consume.
    pub master_waybill_id: MasterWaybillId,
    /// Product shipped.
    pub product_id: ProductId,
    /// First destination.
    pub origin_destination_id: DestinationId,
    /// Final destination.
    pub final_destination_id: DestinationId,
    /// Payment mode.
    pub payment_mode: PaymentMode,
    /// Planned flight date.
    pub flight_date: NaiveDate,
    /// Cost/service fields.
    pub charges: Charges,
    /// Free-text observations.
    pub observations: Option<String>,
    /// Consignee set; exactly one principal.
    pub consignees: Vec<ConsigneeRequest>,
}

/// Partial update of a coordination record. `None` leaves a field unchanged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CoordinationPatch {
    /// New product.
    pub product_id: Option<ProductId>,
    /// New first destination.
    pub origin_destination_id: Option<DestinationId>,
    /// New final destination.
    pub final_destination_id: Option<DestinationId>,
    /// New payment mode.
    pub payment_mode: Option<PaymentMode>,
    /// New flight date.
    pub flight_date: Option<NaiveDate>,
    /// New charges.
    pub charges: Option<Charges>,
    /// New observations; `Some(None)` clears them.
    pub observations: Option<Option<String>>,
    /// Replacement consignee set.
    pub consignees: Option<Vec<ConsigneeRequest>>,
}

/// A record with its consignees.
#[derive(Clone, Debug, PartialEq)]
pub struct CoordinationView {
    /// The record.
    pub record: CoordinationRecord,
    /// Its consignees, principal first.
    pub consignees: Vec<ConsigneeAssignment>,
}

impl CoordinationView {
    /// The principal consignee.
    #[must_use]
    pub fn principal(&self) -> Option<ConsigneeId> {
        principal_of(&self.consignees)
    }
}

#[derive(Clone, Copy, Debug)]
struct LifecycleStates {
    master_available: StateId,
    master_assigned: StateId,
    cut: StateId,
    cancelled: StateId,
    child_cancelled: StateId,
}

/// Coordination record operations.
#[derive(Clone)]
pub struct CoordinationService<S: DocumentStore> {
    engine: WorkflowEngine<S>,
    catalog: Arc<dyn CatalogLookup>,
    states: LifecycleStates,
}

impl<S: DocumentStore> CoordinationService<S> {
    /// Create the service, resolving the state ids it depends on.
    ///
    /// # Errors
    ///
    /// [`DocumentError::WorkflowConfig`] if a required state is not configured.
    pub fn new(engine: WorkflowEngine<S>, catalog: Arc<dyn CatalogLookup>) -> Result<Self> {
        let d = engine.definition();
        let states = LifecycleStates {
            master_available: d.require_state(EntityKind::MasterWaybill, master_states::AVAILABLE)?,
            master_assigned: d.require_state(EntityKind::MasterWaybill, master_states::ASSIGNED)?,
            cut: d.require_state(EntityKind::Coordination, coordination_states::CUT)?,
            cancelled: d.require_state(EntityKind::Coordination, coordination_states::CANCELLED)?,
            child_cancelled: d.require_state(EntityKind::ChildWaybill, child_states::CANCELLED)?,
        };
        Ok(Self {
            engine,
            catalog,
            states,
        })
    }

    /// Create a record and assign its master waybill.
    ///
    /// # Errors
    ///
    /// - [`DocumentError::PreconditionFailed`] for an invalid consignee set, or a
    ///   master waybill that is not available, is lent or returned, or is held by
    ///   an active record
    /// - [`DocumentError::NotFound`] for an unknown master waybill or catalog entity
    #[tracing::instrument(skip(self, request, actor), fields(master_waybill_id = %request.master_waybill_id, actor = %actor.id))]
    pub async fn create(&self, request: CreateCoordination, actor: &Actor) -> Result<CoordinationView> {
        validate_consignees(&request.consignees).map_err(DocumentError::PreconditionFailed)?;
        self.require_catalog(CatalogKind::Product, request.product_id.get()).await?;
        self.require_catalog(CatalogKind::Destination, request.origin_destination_id.get())
            .await?;
        self.require_catalog(CatalogKind::Destination, request.final_destination_id.get())
            .await?;
        for consignee in &request.consignees {
            self.require_catalog(CatalogKind::Consignee, consignee.consignee_id.get())
                .await?;
        }

        let definition = self.engine.definition();
        let mut tx = self.engine.store().begin().await?;

        let waybill = tx
            .get_master_waybill(request.master_waybill_id)
            .await?
            .ok_or_else(|| {
                DocumentError::not_found("master_waybill", request.master_waybill_id.get())
            })?;
        if waybill.current_state != self.states.master_available || !waybill.is_unencumbered() {
            return Err(DocumentError::precondition(format!(
                "master waybill {} is not available for coordination",
                waybill.number()
            )));
        }
        let finals = definition.final_states(EntityKind::Coordination);
        if let Some(active) = tx.active_coordination_for(waybill.id, &finals).await? {
            return Err(DocumentError::precondition(format!(
                "master waybill {} is held by active coordination {active}",
                waybill.number()
            )));
        }

        let master_change = self
            .engine
            .apply(
                &mut tx,
                &TransitionRequest::new(
                    EntityKind::MasterWaybill,
                    waybill.id.get(),
                    self.states.master_available,
                    self.states.master_assigned,
                    Actor::system(),
                ),
            )
            .await?;

        let initial = definition.initial_state(EntityKind::Coordination);
        let now = self.engine.clock().now();
        let id = tx
            .insert_coordination(NewCoordination {
                master_waybill_id: waybill.id,
                product_id: request.product_id,
                origin_destination_id: request.origin_destination_id,
                final_destination_id: request.final_destination_id,
                payment_mode: request.payment_mode,
                flight_date: request.flight_date,
                charges: request.charges,
                observations: request.observations,
                state: initial,
                created_at: now,
            })
            .await?;
        tx.append_history(NewStateHistory {
            entity_kind: EntityKind::Coordination,
            entity_id: id.get(),
            state_id: initial,
            actor_id: actor.id.clone(),
            comment: None,
            recorded_at: now,
        })
        .await?;
        tx.replace_consignees(id, &request.consignees).await?;

        let view = load_view(&mut tx, id).await?;
        tx.commit().await?;

        tracing::info!(coordination_id = %id, waybill = %waybill.number(), "Coordination created");
        self.engine.dispatcher().dispatch_all([
            DocumentEvent::MasterWaybillStateChanged(master_change),
            DocumentEvent::CoordinationStateChanged(StateChange {
                entity_kind: EntityKind::Coordination,
                entity_id: id.get(),
                from: initial,
                to: initial,
                actor_id: actor.id.clone(),
                comment: None,
                at: now,
            }),
        ]);
        Ok(view)
    }

    /// Patch a non-final record, optionally replacing its consignees.
    ///
    /// # Errors
    ///
    /// - [`DocumentError::NotFound`] for an unknown record or catalog entity
    /// - [`DocumentError::PreconditionFailed`] for a final record, an invalid consignee set,
    ///   or a replacement that drops a consignee with live child waybills
    pub async fn update(
        &self,
        id: CoordinationId,
        patch: CoordinationPatch,
        actor: &Actor,
    ) -> Result<CoordinationView> {
        if let Some(consignees) = &patch.consignees {
            validate_consignees(consignees).map_err(DocumentError::PreconditionFailed)?;
            for consignee in consignees {
                self.require_catalog(CatalogKind::Consignee, consignee.consignee_id.get())
                    .await?;
            }
        }
        if let Some(product) = patch.product_id {
            self.require_catalog(CatalogKind::Product, product.get()).await?;
        }
        for destination in [patch.origin_destination_id, patch.final_destination_id]
            .into_iter()
            .flatten()
        {
            self.require_catalog(CatalogKind::Destination, destination.get())
                .await?;
        }

        let mut tx = self.engine.store().begin().await?;
        let mut record = self.load_open(&mut tx, id).await?;

        if let Some(consignees) = &patch.consignees {
            let orphaned = tx.children_of(id).await?.into_iter().find(|child| {
                child.current_state != self.states.child_cancelled
                    && !consignees.iter().any(|c| c.consignee_id == child.consignee_id)
            });
            if let Some(child) = orphaned {
                return Err(DocumentError::precondition(format!(
                    "consignee {} still receives child waybill {}",
                    child.consignee_id, child.number
                )));
            }
        }

        if let Some(product) = patch.product_id {
            record.product_id = product;
        }
        if let Some(origin) = patch.origin_destination_id {
            record.origin_destination_id = origin;
        }
        if let Some(destination) = patch.final_destination_id {
            record.final_destination_id = destination;
        }
        if let Some(mode) = patch.payment_mode {
            record.payment_mode = mode;
        }
        if let Some(date) = patch.flight_date {
            record.flight_date = date;
        }
        if let Some(charges) = patch.charges {
            record.charges = charges;
        }
        if let Some(observations) = patch.observations {
            record.observations = observations;
        }
        record.updated_at = self.engine.clock().now();
        tx.update_coordination(&record).await?;

        if let Some(consignees) = &patch.consignees {
            tx.replace_consignees(id, consignees).await?;
        }

        let view = load_view(&mut tx, id).await?;
        tx.commit().await?;
        tracing::info!(coordination_id = %id, actor = %actor.id, "Coordination updated");
        Ok(view)
    }

    /// Finalize a record that has at least one non-cancelled child waybill.
    ///
    /// # Errors
    ///
    /// - [`DocumentError::NotFound`] for an unknown record
    /// - [`DocumentError::PreconditionFailed`] for a final record or one without child waybills
    /// - transition errors from [`WorkflowEngine::apply`]
    #[tracing::instrument(skip(self, actor, comment), fields(actor = %actor.id))]
    pub async fn cut(&self, id: CoordinationId, actor: Actor, comment: Option<String>) -> Result<StateChange> {
        let mut tx = self.engine.store().begin().await?;
        let record = self.load_open(&mut tx, id).await?;

        let child_count = tx
            .children_of(id)
            .await?
            .iter()
            .filter(|child| child.current_state != self.states.child_cancelled)
            .count();
        if child_count == 0 {
            return Err(DocumentError::precondition(format!(
                "coordination {id} has no child waybills to cut"
            )));
        }
        let principal = principal_of(&tx.consignees(id).await?).ok_or_else(|| {
            DocumentError::precondition(format!("coordination {id} has no principal consignee"))
        })?;

        let change = self
            .engine
            .apply(
                &mut tx,
                &TransitionRequest::new(
                    EntityKind::Coordination,
                    id.get(),
                    record.current_state,
                    self.states.cut,
                    actor,
                )
                .with_comment(comment),
            )
            .await?;
        tx.commit().await?;

        tracing::info!(coordination_id = %id, child_count, "Coordination cut");
        self.engine.dispatcher().dispatch_all([
            DocumentEvent::CoordinationStateChanged(change.clone()),
            DocumentEvent::CoordinationCut {
                coordination_id: id,
                child_count,
                principal_consignee_id: principal,
                cut_at: change.at,
            },
        ]);
        Ok(change)
    }

    /// Cancel a record and release its master waybill in one transaction.
    ///
    /// # Errors
    ///
    /// - [`DocumentError::NotFound`] for an unknown record
    /// - [`DocumentError::PreconditionFailed`] for a final record, or a master
    ///   waybill that is no longer assigned
    /// - transition errors from [`WorkflowEngine::apply`]
    #[tracing::instrument(skip(self, actor, comment), fields(actor = %actor.id))]
    pub async fn cancel(
        &self,
        id: CoordinationId,
        actor: Actor,
        comment: Option<String>,
    ) -> Result<StateChange> {
        let mut tx = self.engine.store().begin().await?;
        let record = self.load_open(&mut tx, id).await?;

        let change = self
            .engine
            .apply(
                &mut tx,
                &TransitionRequest::new(
                    EntityKind::Coordination,
                    id.get(),
                    record.current_state,
                    self.states.cancelled,
                    actor,
                )
                .with_comment(comment.clone()),
            )
            .await?;
        let release = self
            .engine
            .apply(
                &mut tx,
                &TransitionRequest::new(
                    EntityKind::MasterWaybill,
                    record.master_waybill_id.get(),
                    self.states.master_assigned,
                    self.states.master_available,
                    Actor::system(),
                )
                .with_comment(Some(format!("released by cancelled coordination {id}"))),
            )
            .await?;
        tx.commit().await?;

        tracing::info!(
            coordination_id = %id,
            master_waybill_id = %record.master_waybill_id,
            "Coordination cancelled, master waybill released"
        );
        self.engine.dispatcher().dispatch_all([
            DocumentEvent::CoordinationStateChanged(change.clone()),
            DocumentEvent::MasterWaybillStateChanged(release),
        ]);
        Ok(change)
    }

    /// Move a record to `to` from its current state. Cut and cancellation
    /// targets are routed through [`cut`](Self::cut) and [`cancel`](Self::cancel)
    /// so their side effects always apply.
    ///
    /// # Errors
    ///
    /// See [`WorkflowEngine::apply`].
    pub async fn transition(
        &self,
        id: CoordinationId,
        to: StateId,
        actor: Actor,
        comment: Option<String>,
    ) -> Result<StateChange> {
        if to == self.states.cut {
            return self.cut(id, actor, comment).await;
        }
        if to == self.states.cancelled {
            return self.cancel(id, actor, comment).await;
        }
        let current = self.get(id).await?.record.current_state;
        self.engine
            .execute(
                TransitionRequest::new(EntityKind::Coordination, id.get(), current, to, actor)
                    .with_comment(comment),
            )
            .await
    }

    /// Sum the quantities of a record's non-cancelled child waybills.
    ///
    /// # Errors
    ///
    /// [`DocumentError::NotFound`] for an unknown record.
    pub async fn box_summary(&self, id: CoordinationId) -> Result<BoxSummary> {
        let mut tx = self.engine.store().begin().await?;
        load_record(&mut tx, id).await?;
        let children = tx.children_of(id).await?;
        Ok(children
            .iter()
            .filter(|child| child.current_state != self.states.child_cancelled)
            .map(|child| &child.quantities)
            .collect())
    }

    /// Load a record with its consignees.
    ///
    /// # Errors
    ///
    /// [`DocumentError::NotFound`] for an unknown record.
    pub async fn get(&self, id: CoordinationId) -> Result<CoordinationView> {
        let mut tx = self.engine.store().begin().await?;
        load_view(&mut tx, id).await
    }

    /// Transitions `roles` may execute from the record's current state.
    ///
    /// # Errors
    ///
    /// [`DocumentError::NotFound`] for an unknown record.
    pub async fn available_actions(
        &self,
        id: CoordinationId,
        roles: Option<&RoleSet>,
    ) -> Result<Vec<TransitionDefinition>> {
        let record = self.get(id).await?.record;
        Ok(self
            .engine
            .transitions_from(EntityKind::Coordination, record.current_state, roles)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn require_catalog(&self, kind: CatalogKind, id: i64) -> Result<()> {
        if self.catalog.exists(kind, id).await? {
            Ok(())
        } else {
            Err(DocumentError::not_found(kind.as_str(), id))
        }
    }

    async fn load_open(&self, tx: &mut S::Tx, id: CoordinationId) -> Result<CoordinationRecord> {
        let record = load_record(tx, id).await?;
        if self.engine.definition().is_final(record.current_state) {
            return Err(DocumentError::precondition(format!(
                "coordination {id} is already final"
            )));
        }
        Ok(record)
    }
}

fn principal_of(consignees: &[ConsigneeAssignment]) -> Option<ConsigneeId> {
    consignees
        .iter()
        .find(|c| c.is_principal)
        .map(|c| c.consignee_id)
}

async fn load_record<T: DocumentTx>(tx: &mut T, id: CoordinationId) -> Result<CoordinationRecord> {
    tx.get_coordination(id)
        .await?
        .ok_or_else(|| DocumentError::not_found("coordination", id.get()))
}

async fn load_view<T: DocumentTx>(tx: &mut T, id: CoordinationId) -> Result<CoordinationView> {
    let record = load_record(tx, id).await?;
    let consignees = tx.consignees(id).await?;
    Ok(CoordinationView { record, consignees })
}
