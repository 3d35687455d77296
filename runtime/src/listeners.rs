//! Built-in event listeners.

use crate::dispatcher::{EventListener, ListenerError};
use crate::engine::{TransitionRequest, WorkflowEngine};
use chrono::Duration;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use waybill_flow_core::constants::{child_states, coordination_states};
use waybill_flow_core::error::{DocumentError, Result};
use waybill_flow_core::event::{DocumentEvent, EventEnvelope, EventKind};
use waybill_flow_core::providers::{AccrualOutcome, PointsAccrual, PointsLedger};
use waybill_flow_core::store::{DocumentStore, DocumentTx};
use waybill_flow_core::types::{Actor, CoordinationId};
use waybill_flow_core::workflow::{EntityKind, StateId};

// ============================================================================
// Loyalty accrual
// ============================================================================

/// Credits loyalty points to the principal consignee when a record is cut.
pub struct LoyaltyAccrualListener {
    ledger: Arc<dyn PointsLedger>,
    points_per_child: i64,
    expiry: Duration,
}

impl LoyaltyAccrualListener {
    /// Topics this listener consumes.
    pub const TOPICS: [EventKind; 1] = [EventKind::CoordinationCut];

    /// Create the listener.
    #[must_use]
    pub fn new(ledger: Arc<dyn PointsLedger>, points_per_child: i64, expiry_days: i64) -> Self {
        Self {
            ledger,
            points_per_child,
            expiry: Duration::days(expiry_days),
        }
    }

    /// Ledger key that makes a cut credit at most once.
    #[must_use]
    pub fn idempotency_key(coordination_id: CoordinationId) -> String {
        format!("coordination-cut:{coordination_id}")
    }

    async fn accrue(&self, event: &DocumentEvent) -> std::result::Result<(), ListenerError> {
        let DocumentEvent::CoordinationCut {
            coordination_id,
            child_count,
            principal_consignee_id,
            cut_at,
        } = event
        else {
            return Ok(());
        };

        let points = i64::try_from(*child_count)
            .unwrap_or(i64::MAX)
            .saturating_mul(self.points_per_child);
        if points <= 0 {
            tracing::debug!(%coordination_id, "No loyalty points to credit");
            return Ok(());
        }

        let outcome = self
            .ledger
            .accrue(PointsAccrual {
                account: *principal_consignee_id,
                points,
                reason: format!("coordination {coordination_id} cut with {child_count} child waybills"),
                expires_at: *cut_at + self.expiry,
                idempotency_key: Self::idempotency_key(*coordination_id),
            })
            .await?;

        match outcome {
            AccrualOutcome::Credited => tracing::info!(
                %coordination_id,
                consignee_id = %principal_consignee_id,
                points,
                "Loyalty points credited"
            ),
            AccrualOutcome::AlreadyApplied => {
                tracing::debug!(%coordination_id, "Loyalty points already credited");
            },
        }
        Ok(())
    }
}

impl EventListener for LoyaltyAccrualListener {
    fn name(&self) -> &'static str {
        "loyalty_accrual"
    }

    fn handle<'a>(
        &'a self,
        envelope: &'a EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<(), ListenerError>> + Send + 'a>> {
        Box::pin(self.accrue(&envelope.event))
    }
}

// ============================================================================
// Cascade auto-promotion
// ============================================================================

/// Promotes a coordination record to "coordinated" once every non-cancelled
/// child waybill is confirmed.
pub struct CascadeCoordinationListener<S: DocumentStore> {
    engine: WorkflowEngine<S>,
    child_confirmed: StateId,
    child_cancelled: StateId,
    coordinated: StateId,
}

impl<S: DocumentStore> CascadeCoordinationListener<S> {
    /// Topics this listener consumes.
    pub const TOPICS: [EventKind; 1] = [EventKind::ChildWaybillStateChanged];

    /// Create the listener, resolving the state ids it depends on.
    ///
    /// # Errors
    ///
    /// [`DocumentError::WorkflowConfig`] if a required state is not configured.
    pub fn new(engine: WorkflowEngine<S>) -> Result<Self> {
        let d = engine.definition();
        Ok(Self {
            child_confirmed: d.require_state(EntityKind::ChildWaybill, child_states::CONFIRMED)?,
            child_cancelled: d.require_state(EntityKind::ChildWaybill, child_states::CANCELLED)?,
            coordinated: d.require_state(EntityKind::Coordination, coordination_states::COORDINATED)?,
            engine,
        })
    }

    async fn promote(&self, event: &DocumentEvent) -> Result<()> {
        let DocumentEvent::ChildWaybillStateChanged {
            change,
            coordination_id,
        } = event
        else {
            return Ok(());
        };
        if change.to != self.child_confirmed {
            return Ok(());
        }

        let mut tx = self.engine.store().begin().await?;
        let Some(record) = tx.get_coordination(*coordination_id).await? else {
            tracing::debug!(%coordination_id, "Coordination gone, skipping cascade");
            return Ok(());
        };
        let definition = self.engine.definition();
        if definition
            .transition(EntityKind::Coordination, record.current_state, self.coordinated)
            .is_none()
        {
            return Ok(());
        }

        let children = tx.children_of(record.id).await?;
        let active: Vec<StateId> = children
            .iter()
            .map(|c| c.current_state)
            .filter(|state| *state != self.child_cancelled)
            .collect();
        if active.is_empty() || active.iter().any(|state| *state != self.child_confirmed) {
            return Ok(());
        }

        let change = self
            .engine
            .apply(
                &mut tx,
                &TransitionRequest::new(
                    EntityKind::Coordination,
                    record.id.get(),
                    record.current_state,
                    self.coordinated,
                    Actor::system(),
                )
                .with_comment(Some("all child waybills confirmed".to_string())),
            )
            .await?;
        tx.commit().await?;

        tracing::info!(coordination_id = %record.id, "Coordination promoted to coordinated");
        self.engine
            .dispatcher()
            .dispatch(DocumentEvent::CoordinationStateChanged(change));
        Ok(())
    }
}

impl<S: DocumentStore> EventListener for CascadeCoordinationListener<S> {
    fn name(&self) -> &'static str {
        "cascade_coordination"
    }

    fn handle<'a>(
        &'a self,
        envelope: &'a EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<(), ListenerError>> + Send + 'a>> {
        Box::pin(async move {
            match self.promote(&envelope.event).await {
                // Another delivery or a user got there first.
                Err(DocumentError::PreconditionFailed(reason)) => {
                    tracing::debug!(%reason, "Cascade skipped");
                    Ok(())
                },
                other => other.map_err(ListenerError::from),
            }
        })
    }
}
