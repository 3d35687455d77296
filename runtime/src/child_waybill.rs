//! Child waybill assignment and transitions.

use crate::allocation::{Allocation, AllocationRequest, AllocationResolver};
use crate::engine::{TransitionRequest, WorkflowEngine};
use crate::retry::{RetryPolicy, retry_with_predicate};
use std::sync::Arc;
use waybill_flow_core::allocation::AllocationKey;
use waybill_flow_core::error::{DocumentError, Result};
use waybill_flow_core::event::{DocumentEvent, StateChange};
use waybill_flow_core::providers::{CatalogKind, CatalogLookup};
use waybill_flow_core::store::{DocumentStore, DocumentTx};
use waybill_flow_core::types::{
    Actor, ChildWaybill, ChildWaybillId, ConsigneeId, CoordinationId, FarmId, ProductId,
    Quantities,
};
use waybill_flow_core::workflow::{EntityKind, StateId};

/// A request to allocate a farm's cargo to a coordination record.
#[derive(Clone, Debug, PartialEq)]
pub struct AssignChild {
    /// Target record.
    pub coordination_id: CoordinationId,
    /// Shipping farm.
    pub farm_id: FarmId,
    /// Product; defaults to the record's product.
    pub product_id: Option<ProductId>,
    /// Receiving consignee; must be one of the record's consignees.
    pub consignee_id: ConsigneeId,
    /// Quantities; `None` keeps existing ones.
    pub quantities: Option<Quantities>,
}

/// Child waybill operations.
#[derive(Clone)]
pub struct ChildWaybillService<S: DocumentStore> {
    engine: WorkflowEngine<S>,
    catalog: Arc<dyn CatalogLookup>,
    resolver: AllocationResolver,
    retry: RetryPolicy,
}

impl<S: DocumentStore> ChildWaybillService<S> {
    /// Create the service.
    #[must_use]
    pub fn new(
        engine: WorkflowEngine<S>,
        catalog: Arc<dyn CatalogLookup>,
        resolver: AllocationResolver,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            engine,
            catalog,
            resolver,
            retry,
        }
    }

    /// The allocation resolver in use.
    #[must_use]
    pub const fn resolver(&self) -> &AllocationResolver {
        &self.resolver
    }

    /// Allocate a child waybill, creating, reusing or re-pointing it.
    ///
    /// A lost race on the dedup key is replayed under the retry policy; the
    /// replay finds the winner's row.
    ///
    /// # Errors
    ///
    /// - [`DocumentError::NotFound`] for an unknown record, farm or product
    /// - [`DocumentError::PreconditionFailed`] for a final record or a consignee
    ///   that does not belong to it
    /// - [`DocumentError::DuplicateAllocation`] if the race persists past the retry budget
    #[tracing::instrument(skip(self, request, actor), fields(coordination_id = %request.coordination_id, farm_id = %request.farm_id))]
    pub async fn assign(&self, request: AssignChild, actor: &Actor) -> Result<Allocation> {
        self.require_catalog(CatalogKind::Farm, request.farm_id.get()).await?;
        if let Some(product) = request.product_id {
            self.require_catalog(CatalogKind::Product, product.get()).await?;
        }

        let allocation = retry_with_predicate(
            &self.retry,
            || self.assign_once(&request, actor),
            DocumentError::is_retryable,
        )
        .await?;

        self.engine.dispatcher().dispatch(DocumentEvent::ChildWaybillAssigned {
            child_waybill_id: allocation.child.id,
            coordination_id: allocation.child.coordination_id,
            number: allocation.child.number.clone(),
            reused: allocation.reused(),
        });
        Ok(allocation)
    }

    async fn assign_once(&self, request: &AssignChild, actor: &Actor) -> Result<Allocation> {
        let mut tx = self.engine.store().begin().await?;
        let record = tx
            .get_coordination(request.coordination_id)
            .await?
            .ok_or_else(|| {
                DocumentError::not_found("coordination", request.coordination_id.get())
            })?;
        if self.engine.definition().is_final(record.current_state) {
            return Err(DocumentError::precondition(format!(
                "coordination {} is already final",
                record.id
            )));
        }
        let consignees = tx.consignees(record.id).await?;
        if !consignees
            .iter()
            .any(|c| c.consignee_id == request.consignee_id)
        {
            return Err(DocumentError::precondition(format!(
                "consignee {} is not assigned to coordination {}",
                request.consignee_id, record.id
            )));
        }

        let key = AllocationKey {
            farm_id: request.farm_id,
            master_waybill_id: record.master_waybill_id,
            consignee_id: request.consignee_id,
            product_id: request.product_id.unwrap_or(record.product_id),
        };
        let allocation = self
            .resolver
            .allocate(
                &mut tx,
                AllocationRequest {
                    coordination_id: record.id,
                    key,
                    quantities: request.quantities,
                    actor,
                },
            )
            .await?;
        tx.commit().await?;
        Ok(allocation)
    }

    /// Move a child waybill to `to` from its current state.
    ///
    /// # Errors
    ///
    /// See [`WorkflowEngine::apply`].
    pub async fn transition(
        &self,
        id: ChildWaybillId,
        to: StateId,
        actor: Actor,
        comment: Option<String>,
    ) -> Result<StateChange> {
        let current = self.get(id).await?.current_state;
        self.engine
            .execute(
                TransitionRequest::new(EntityKind::ChildWaybill, id.get(), current, to, actor)
                    .with_comment(comment),
            )
            .await
    }

    /// Load a child waybill.
    ///
    /// # Errors
    ///
    /// [`DocumentError::NotFound`] for an unknown id.
    pub async fn get(&self, id: ChildWaybillId) -> Result<ChildWaybill> {
        let mut tx = self.engine.store().begin().await?;
        tx.get_child(id)
            .await?
            .ok_or_else(|| DocumentError::not_found("child_waybill", id.get()))
    }

    /// Child waybills of a record, in every state.
    ///
    /// # Errors
    ///
    /// [`DocumentError::NotFound`] for an unknown record.
    pub async fn list_for_coordination(&self, id: CoordinationId) -> Result<Vec<ChildWaybill>> {
        let mut tx = self.engine.store().begin().await?;
        if tx.get_coordination(id).await?.is_none() {
            return Err(DocumentError::not_found("coordination", id.get()));
        }
        Ok(tx.children_of(id).await?)
    }

    async fn require_catalog(&self, kind: CatalogKind, id: i64) -> Result<()> {
        if self.catalog.exists(kind, id).await? {
            Ok(())
        } else {
            Err(DocumentError::not_found(kind.as_str(), id))
        }
    }
}
