//! Master waybill stock: batch issue, loans, returns and manual transitions.

use crate::engine::{TransitionRequest, WorkflowEngine};
use chrono::NaiveDate;
use waybill_flow_core::constants::master_states;
use waybill_flow_core::error::{DocumentError, Result};
use waybill_flow_core::event::{DocumentEvent, StateChange};
use waybill_flow_core::sequence;
use waybill_flow_core::store::{DocumentStore, DocumentTx};
use waybill_flow_core::types::{Actor, MasterWaybill, MasterWaybillId, NewMasterWaybill, WaybillBatch};
use waybill_flow_core::workflow::{EntityKind, NewStateHistory, StateId};

/// A batch of airline stock to register.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateBatchRequest {
    /// Airline numeric prefix.
    pub prefix: i32,
    /// First serial of the batch.
    pub initial: u64,
    /// Number of waybills.
    pub count: usize,
    /// Batch reference shared by every waybill.
    pub batch: WaybillBatch,
    /// Observations copied to every waybill.
    pub observations: Option<String>,
    /// Who registers the stock.
    pub actor: Actor,
}

#[derive(Clone, Copy, Debug)]
struct MasterStates {
    available: StateId,
    assigned: StateId,
}

/// Master waybill operations.
#[derive(Clone)]
pub struct MasterWaybillService<S: DocumentStore> {
    engine: WorkflowEngine<S>,
    states: MasterStates,
}

impl<S: DocumentStore> MasterWaybillService<S> {
    /// Create the service, resolving the state ids it depends on.
    ///
    /// # Errors
    ///
    /// [`DocumentError::WorkflowConfig`] if `available` or `assigned` is not configured.
    pub fn new(engine: WorkflowEngine<S>) -> Result<Self> {
        let definition = engine.definition();
        let states = MasterStates {
            available: definition.require_state(EntityKind::MasterWaybill, master_states::AVAILABLE)?,
            assigned: definition.require_state(EntityKind::MasterWaybill, master_states::ASSIGNED)?,
        };
        Ok(Self { engine, states })
    }

    /// The serials a batch would receive, without persisting anything.
    ///
    /// # Errors
    ///
    /// [`DocumentError::Sequence`] for a zero initial serial or overflow.
    pub fn preview(&self, initial: u64, count: usize) -> Result<Vec<u64>> {
        Ok(sequence::preview(initial, count)?)
    }

    /// Register a batch of stock in the initial state.
    ///
    /// Either every waybill of the batch is inserted or none is.
    ///
    /// # Errors
    ///
    /// - [`DocumentError::InvalidInput`] for `count == 0`, `initial == 0`, or a serial beyond `i64`
    /// - [`DocumentError::PreconditionFailed`] if any `(prefix, sequence)` already exists
    #[tracing::instrument(skip(self, request), fields(prefix = request.prefix, initial = request.initial, count = request.count))]
    pub async fn create_batch(&self, request: CreateBatchRequest) -> Result<Vec<MasterWaybill>> {
        if request.count == 0 {
            return Err(DocumentError::InvalidInput("batch count must be positive".into()));
        }
        if request.initial == 0 {
            return Err(DocumentError::InvalidInput("initial sequence must be positive".into()));
        }
        let serials = sequence::generate(request.initial, request.count)?;

        let initial_state = self.engine.definition().initial_state(EntityKind::MasterWaybill);
        let now = self.engine.clock().now();
        let mut tx = self.engine.store().begin().await?;
        let mut created = Vec::with_capacity(serials.len());

        for serial in serials {
            let sequence = i64::try_from(serial).map_err(|_| {
                DocumentError::InvalidInput(format!("sequence {serial} does not fit the store"))
            })?;
            if tx.master_waybill_exists(request.prefix, sequence).await? {
                return Err(DocumentError::precondition(format!(
                    "master waybill {:03}-{sequence:08} already exists",
                    request.prefix
                )));
            }

            let id = tx
                .insert_master_waybill(NewMasterWaybill {
                    prefix: request.prefix,
                    sequence,
                    batch: request.batch.clone(),
                    state: initial_state,
                    observations: request.observations.clone(),
                    created_at: now,
                })
                .await?;
            tx.append_history(NewStateHistory {
                entity_kind: EntityKind::MasterWaybill,
                entity_id: id.get(),
                state_id: initial_state,
                actor_id: request.actor.id.clone(),
                comment: None,
                recorded_at: now,
            })
            .await?;

            let waybill = tx
                .get_master_waybill(id)
                .await?
                .ok_or_else(|| DocumentError::not_found("master_waybill", id.get()))?;
            created.push(waybill);
        }

        tx.commit().await?;
        tracing::info!(created = created.len(), "Master waybill batch registered");
        Ok(created)
    }

    /// Lend an available waybill to another agency.
    ///
    /// # Errors
    ///
    /// - [`DocumentError::NotFound`] for an unknown id
    /// - [`DocumentError::PreconditionFailed`] unless available, not lent and not returned
    pub async fn lend(&self, id: MasterWaybillId, on: NaiveDate, actor: &Actor) -> Result<MasterWaybill> {
        let mut tx = self.engine.store().begin().await?;
        let mut waybill = load(&mut tx, id).await?;

        if waybill.current_state != self.states.available {
            return Err(DocumentError::precondition(format!(
                "master waybill {} is not available",
                waybill.number()
            )));
        }
        if !waybill.is_unencumbered() {
            return Err(DocumentError::precondition(format!(
                "master waybill {} is already lent or returned",
                waybill.number()
            )));
        }

        waybill.on_loan = true;
        waybill.loaned_on = Some(on);
        waybill.updated_at = self.engine.clock().now();
        tx.update_master_waybill(&waybill).await?;
        tx.commit().await?;

        tracing::info!(waybill = %waybill.number(), actor = %actor.id, "Master waybill lent");
        self.engine.dispatcher().dispatch(DocumentEvent::MasterWaybillLent {
            master_waybill_id: id,
            loaned_on: on,
            actor_id: actor.id.clone(),
        });
        Ok(waybill)
    }

    /// Mark a waybill as returned unused to the airline.
    ///
    /// # Errors
    ///
    /// - [`DocumentError::NotFound`] for an unknown id
    /// - [`DocumentError::PreconditionFailed`] if already returned or bound to an active record
    pub async fn mark_returned(
        &self,
        id: MasterWaybillId,
        on: NaiveDate,
        actor: &Actor,
    ) -> Result<MasterWaybill> {
        let mut tx = self.engine.store().begin().await?;
        let mut waybill = load(&mut tx, id).await?;

        if waybill.returned {
            return Err(DocumentError::precondition(format!(
                "master waybill {} is already returned",
                waybill.number()
            )));
        }
        let finals = self.engine.definition().final_states(EntityKind::Coordination);
        let active = tx.active_coordination_for(id, &finals).await?;
        if waybill.current_state == self.states.assigned || active.is_some() {
            return Err(DocumentError::precondition(format!(
                "master waybill {} is assigned to an active {}",
                waybill.number(),
                EntityKind::Coordination
            )));
        }

        waybill.returned = true;
        waybill.returned_on = Some(on);
        waybill.updated_at = self.engine.clock().now();
        tx.update_master_waybill(&waybill).await?;
        tx.commit().await?;

        tracing::info!(waybill = %waybill.number(), actor = %actor.id, "Master waybill returned");
        self.engine.dispatcher().dispatch(DocumentEvent::MasterWaybillReturned {
            master_waybill_id: id,
            returned_on: on,
            actor_id: actor.id.clone(),
        });
        Ok(waybill)
    }

    /// Move a waybill to `to` from its current state, e.g. to void it.
    ///
    /// # Errors
    ///
    /// See [`WorkflowEngine::apply`].
    pub async fn transition(
        &self,
        id: MasterWaybillId,
        to: StateId,
        actor: Actor,
        comment: Option<String>,
    ) -> Result<StateChange> {
        let current = self.get(id).await?.current_state;
        self.engine
            .execute(
                TransitionRequest::new(EntityKind::MasterWaybill, id.get(), current, to, actor)
                    .with_comment(comment),
            )
            .await
    }

    /// Load a waybill.
    ///
    /// # Errors
    ///
    /// [`DocumentError::NotFound`] for an unknown id.
    pub async fn get(&self, id: MasterWaybillId) -> Result<MasterWaybill> {
        let mut tx = self.engine.store().begin().await?;
        load(&mut tx, id).await
    }

    /// Whether a waybill can be bound to a new coordination record.
    ///
    /// # Errors
    ///
    /// [`DocumentError::NotFound`] for an unknown id.
    pub async fn is_reassignable(&self, id: MasterWaybillId) -> Result<bool> {
        let mut tx = self.engine.store().begin().await?;
        let waybill = load(&mut tx, id).await?;
        let finals = self.engine.definition().final_states(EntityKind::Coordination);
        let active = tx.active_coordination_for(id, &finals).await?;
        Ok(waybill.current_state == self.states.available
            && waybill.is_unencumbered()
            && active.is_none())
    }
}

async fn load<T: DocumentTx>(tx: &mut T, id: MasterWaybillId) -> Result<MasterWaybill> {
    tx.get_master_waybill(id)
        .await?
        .ok_or_else(|| DocumentError::not_found("master_waybill", id.get()))
}
