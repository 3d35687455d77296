//! # Waybill Flow Runtime
//!
//! Workflow engine, document services and event dispatch for the waybill
//! document pipeline.
//!
//! ## Core Components
//!
//! - **[`WorkflowEngine`]**: validates and applies state transitions, writing
//!   the state pointer and history row in the caller's transaction
//! - **Services**: master waybill batches and loans, coordination record
//!   lifecycle, child waybill allocation
//! - **[`EventDispatcher`]**: post-commit fan-out to independent listeners
//! - **Listeners**: loyalty accrual on cut, auto-promotion of coordination
//!   records once every child waybill is confirmed
//!
//! ## Example
//!
//! ```ignore
//! use waybill_flow_runtime::{RuntimeConfig, WaybillFlow};
//!
//! let config = RuntimeConfig::from_env()?;
//! let flow = WaybillFlow::bootstrap(store, &config, catalog, ledger, clock).await?;
//!
//! let record = flow.coordinations.create(request, &actor).await?;
//! flow.children.assign(assignment, &actor).await?;
//! ```

use std::sync::Arc;
use waybill_flow_core::environment::Clock;
use waybill_flow_core::error::Result;
use waybill_flow_core::providers::{CatalogLookup, PointsLedger};
use waybill_flow_core::store::DocumentStore;

/// Child waybill allocation with deduplication
pub mod allocation;

/// Child waybill assignment and transitions
pub mod child_waybill;

/// Environment-driven configuration
pub mod config;

/// Coordination record lifecycle
pub mod coordination;

/// Post-commit event fan-out
pub mod dispatcher;

/// Transition validation and execution
pub mod engine;

/// Built-in event listeners
pub mod listeners;

/// Master waybill batches and loans
pub mod master_waybill;

/// Metric names
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

pub use allocation::{Allocation, AllocationOutcome, AllocationResolver};
pub use child_waybill::{AssignChild, ChildWaybillService};
pub use config::{ConfigError, RuntimeConfig};
pub use coordination::{CoordinationPatch, CoordinationService, CoordinationView, CreateCoordination};
pub use dispatcher::{EventDispatcher, EventListener, ListenerError, StatsSnapshot};
pub use engine::{TransitionRequest, WorkflowEngine};
pub use listeners::{CascadeCoordinationListener, LoyaltyAccrualListener};
pub use master_waybill::{CreateBatchRequest, MasterWaybillService};
pub use retry::RetryPolicy;

/// The assembled pipeline: one engine, its services and the subscribed
/// listeners, all sharing a store, clock and dispatcher.
#[derive(Clone)]
pub struct WaybillFlow<S: DocumentStore> {
    /// Shared transition engine.
    pub engine: WorkflowEngine<S>,
    /// Master waybill operations.
    pub master_waybills: MasterWaybillService<S>,
    /// Coordination record operations.
    pub coordinations: CoordinationService<S>,
    /// Child waybill operations.
    pub children: ChildWaybillService<S>,
}

impl<S: DocumentStore> WaybillFlow<S> {
    /// Load the workflow from `store`, build every service and subscribe the
    /// built-in listeners.
    ///
    /// # Errors
    ///
    /// - [`DocumentError::Numbering`](waybill_flow_core::DocumentError::Numbering)
    ///   if the configured number format is invalid
    /// - [`DocumentError::Store`](waybill_flow_core::DocumentError::Store) if
    ///   the workflow tables cannot be read
    /// - [`DocumentError::WorkflowConfig`](waybill_flow_core::DocumentError::WorkflowConfig)
    ///   if they are inconsistent or lack a state the services rely on
    pub async fn bootstrap(
        store: S,
        config: &RuntimeConfig,
        catalog: Arc<dyn CatalogLookup>,
        ledger: Arc<dyn PointsLedger>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.number_format.validate()?;

        let dispatcher = EventDispatcher::new(config.event_queue_capacity, Arc::clone(&clock));
        let engine = WorkflowEngine::load(store, Arc::clone(&clock), dispatcher.clone()).await?;

        let resolver = AllocationResolver::new(
            config.dedup_rule,
            config.number_format.clone(),
            engine.definition(),
            clock,
        )?;

        let flow = Self {
            master_waybills: MasterWaybillService::new(engine.clone())?,
            coordinations: CoordinationService::new(engine.clone(), Arc::clone(&catalog))?,
            children: ChildWaybillService::new(
                engine.clone(),
                catalog,
                resolver,
                config.allocation_retry_policy(),
            ),
            engine,
        };

        dispatcher.subscribe(
            &LoyaltyAccrualListener::TOPICS,
            Arc::new(LoyaltyAccrualListener::new(
                ledger,
                config.loyalty_points_per_child,
                config.loyalty_expiry_days,
            )),
        );
        dispatcher.subscribe(
            &CascadeCoordinationListener::<S>::TOPICS,
            Arc::new(CascadeCoordinationListener::new(flow.engine.clone())?),
        );

        tracing::info!(
            number_format = config.number_format.kind().as_str(),
            dedup_rule = config.dedup_rule.as_str(),
            "Waybill flow ready"
        );
        Ok(flow)
    }

    /// The shared dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &EventDispatcher {
        self.engine.dispatcher()
    }
}
