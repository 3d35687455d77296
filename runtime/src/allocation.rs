//! Child waybill allocation.
//!
//! The resolver is built with exactly one [`DedupRule`]; the same rule keys
//! the lookup and the stored `dedup_key`, so an allocation either finds the
//! existing child waybill or creates one under the key it just looked up.

use chrono::{DateTime, Datelike, Utc};
use std::sync::Arc;
use waybill_flow_core::allocation::{AllocationKey, DedupRule};
use waybill_flow_core::constants::coordination_states;
use waybill_flow_core::environment::Clock;
use waybill_flow_core::error::{DocumentError, Result, StoreError};
use waybill_flow_core::numbering::{NumberFormat, next_number};
use waybill_flow_core::store::DocumentTx;
use waybill_flow_core::types::{
    Actor, ChildWaybill, ChildWaybillId, CoordinationId, NewChildWaybill, Quantities,
};
use waybill_flow_core::workflow::{EntityKind, NewStateHistory, StateId, WorkflowDefinition};

/// What an allocation did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationOutcome {
    /// A new child waybill was numbered and inserted.
    Created,
    /// An existing child waybill was moved to another coordination record.
    Repointed,
    /// An existing child waybill of the same record was reused.
    Reused,
}

impl AllocationOutcome {
    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Repointed => "repointed",
            Self::Reused => "reused",
        }
    }
}

/// Result of [`AllocationResolver::allocate`].
#[derive(Clone, Debug, PartialEq)]
pub struct Allocation {
    /// The child waybill as stored after the allocation.
    pub child: ChildWaybill,
    /// What happened.
    pub outcome: AllocationOutcome,
}

impl Allocation {
    /// True unless a new child waybill was created.
    #[must_use]
    pub fn reused(&self) -> bool {
        self.outcome != AllocationOutcome::Created
    }
}

/// An allocation request against an already locked coordination record.
#[derive(Clone, Debug, PartialEq)]
pub struct AllocationRequest<'a> {
    /// Target record.
    pub coordination_id: CoordinationId,
    /// Dedup dimensions; `master_waybill_id` is the target record's.
    pub key: AllocationKey,
    /// Quantities to store; `None` keeps existing ones (zero for new rows).
    pub quantities: Option<Quantities>,
    /// Who allocates.
    pub actor: &'a Actor,
}

/// Finds or creates the child waybill for an allocation key.
#[derive(Clone)]
pub struct AllocationResolver {
    rule: DedupRule,
    format: NumberFormat,
    initial_state: StateId,
    closed_children: Vec<StateId>,
    sealed_records: Vec<StateId>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AllocationResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationResolver")
            .field("rule", &self.rule)
            .field("format", &self.format)
            .field("initial_state", &self.initial_state)
            .field("closed_children", &self.closed_children)
            .field("sealed_records", &self.sealed_records)
            .finish_non_exhaustive()
    }
}

impl AllocationResolver {
    /// Create a resolver for one rule and numbering format.
    ///
    /// Child waybills in a final state are never handed out again, and a
    /// child owned by a final record other than a cancelled one stays put.
    ///
    /// # Errors
    ///
    /// [`DocumentError::WorkflowConfig`] if the cancelled coordination state
    /// is not configured.
    pub fn new(
        rule: DedupRule,
        format: NumberFormat,
        definition: &WorkflowDefinition,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let cancelled =
            definition.require_state(EntityKind::Coordination, coordination_states::CANCELLED)?;
        let sealed_records = definition
            .final_states(EntityKind::Coordination)
            .into_iter()
            .filter(|state| *state != cancelled)
            .collect();
        Ok(Self {
            rule,
            format,
            initial_state: definition.initial_state(EntityKind::ChildWaybill),
            closed_children: definition.final_states(EntityKind::ChildWaybill),
            sealed_records,
            clock,
        })
    }

    /// The rule in force.
    #[must_use]
    pub const fn rule(&self) -> DedupRule {
        self.rule
    }

    /// The numbering format in force.
    #[must_use]
    pub const fn format(&self) -> &NumberFormat {
        &self.format
    }

    /// Canonical key of `key` under the rule in force.
    #[must_use]
    pub fn dedup_key(&self, key: &AllocationKey) -> String {
        key.dedup_key(self.rule)
    }

    /// The child waybill already stored under `key`, in any state.
    ///
    /// # Errors
    ///
    /// [`DocumentError::Store`] if the lookup fails.
    pub async fn find_existing<T: DocumentTx>(
        &self,
        tx: &mut T,
        key: &AllocationKey,
    ) -> Result<Option<ChildWaybill>> {
        Ok(tx.find_child_by_key(&self.dedup_key(key)).await?)
    }

    /// Re-point, reuse, or create the child waybill for `request`.
    ///
    /// # Errors
    ///
    /// - [`DocumentError::DuplicateAllocation`] if a concurrent allocation
    ///   inserted the same key first (retryable)
    /// - [`DocumentError::PreconditionFailed`] if the stored child is in a
    ///   final state, or belongs to another record that is cut
    /// - [`DocumentError::Numbering`] if the numbering scope is exhausted
    pub async fn allocate<T: DocumentTx>(
        &self,
        tx: &mut T,
        request: AllocationRequest<'_>,
    ) -> Result<Allocation> {
        let dedup_key = self.dedup_key(&request.key);
        let now = self.clock.now();

        let allocation = match tx.find_child_by_key(&dedup_key).await? {
            Some(mut child) => {
                if self.closed_children.contains(&child.current_state) {
                    return Err(DocumentError::precondition(format!(
                        "child waybill {} under key '{dedup_key}' is closed",
                        child.number
                    )));
                }
                let outcome = if child.coordination_id == request.coordination_id {
                    AllocationOutcome::Reused
                } else {
                    self.require_movable_owner(tx, &child).await?;
                    tracing::info!(
                        child_id = %child.id,
                        from = %child.coordination_id,
                        to = %request.coordination_id,
                        "Re-pointing child waybill"
                    );
                    child.coordination_id = request.coordination_id;
                    child.master_waybill_id = request.key.master_waybill_id;
                    child.consignee_id = request.key.consignee_id;
                    child.product_id = request.key.product_id;
                    child.dedup_key.clone_from(&dedup_key);
                    AllocationOutcome::Repointed
                };
                if let Some(quantities) = request.quantities {
                    child.quantities = quantities;
                }
                if outcome == AllocationOutcome::Repointed || request.quantities.is_some() {
                    child.updated_at = now;
                    tx.update_child(&child).await?;
                }
                Allocation { child, outcome }
            },
            None => {
                let child = self.create(tx, &request, dedup_key, now).await?;
                Allocation {
                    child,
                    outcome: AllocationOutcome::Created,
                }
            },
        };

        metrics::counter!(crate::metrics::ALLOCATIONS, "outcome" => allocation.outcome.as_str())
            .increment(1);
        Ok(allocation)
    }

    async fn require_movable_owner<T: DocumentTx>(&self, tx: &mut T, child: &ChildWaybill) -> Result<()> {
        let owner = tx
            .get_coordination(child.coordination_id)
            .await?
            .ok_or_else(|| DocumentError::not_found("coordination", child.coordination_id.get()))?;
        if self.sealed_records.contains(&owner.current_state) {
            return Err(DocumentError::precondition(format!(
                "child waybill {} belongs to finalized coordination {}",
                child.number, owner.id
            )));
        }
        Ok(())
    }

    async fn create<T: DocumentTx>(
        &self,
        tx: &mut T,
        request: &AllocationRequest<'_>,
        dedup_key: String,
        now: DateTime<Utc>,
    ) -> Result<ChildWaybill> {
        let year = now.year();
        let scope = self.format.scope(year);
        let last = tx.last_issued_sequence(&scope).await?;
        let issued = next_number(&self.format, year, last)?;

        let inserted = tx
            .insert_child(NewChildWaybill {
                coordination_id: request.coordination_id,
                master_waybill_id: request.key.master_waybill_id,
                farm_id: request.key.farm_id,
                product_id: request.key.product_id,
                consignee_id: request.key.consignee_id,
                quantities: request.quantities.unwrap_or_default(),
                number: issued.number.clone(),
                number_format: issued.format,
                year: issued.year,
                sequence: issued.sequence,
                dedup_key: dedup_key.clone(),
                state: self.initial_state,
                created_at: now,
            })
            .await;
        let id: ChildWaybillId = match inserted {
            Ok(id) => id,
            Err(StoreError::UniqueViolation { .. }) => {
                tracing::debug!(key = %dedup_key, "Lost allocation race");
                return Err(DocumentError::DuplicateAllocation { key: dedup_key });
            },
            Err(other) => return Err(other.into()),
        };

        tx.append_history(NewStateHistory {
            entity_kind: EntityKind::ChildWaybill,
            entity_id: id.get(),
            state_id: self.initial_state,
            actor_id: request.actor.id.clone(),
            comment: None,
            recorded_at: now,
        })
        .await?;

        tracing::info!(child_id = %id, number = %issued.number, "Child waybill created");
        tx.get_child(id)
            .await?
            .ok_or_else(|| DocumentError::not_found("child_waybill", id.get()))
    }
}
