//! # Waybill Flow Core
//!
//! Domain types and pure logic for the air-waybill document pipeline of a
//! flower-export cargo forwarder.
//!
//! The pipeline tracks physical air-waybill stock from issue to shipment:
//!
//! - **Master waybills** are pre-numbered stock, generated in batches by the
//!   [`sequence`] generator.
//! - **Coordination records** bind one master waybill to a shipment.
//! - **Child waybills** sub-allocate a record to farms; they are numbered by
//!   [`numbering`] and deduplicated by the rule in [`allocation`].
//!
//! All three kinds move through the table-driven state machine in
//! [`workflow`]. This crate holds the functional core; the services that open
//! transactions, execute transitions and dispatch [`event`]s live in
//! `waybill-flow-runtime`.
//!
//! ## Architecture Principles
//!
//! - Functional Core, Imperative Shell
//! - Configuration as data (states and transitions are rows)
//! - Dependency Injection via traits ([`store`], [`providers`], [`environment`])

pub use chrono::{DateTime, NaiveDate, Utc};

pub mod allocation;
pub mod constants;
pub mod error;
pub mod event;
pub mod numbering;
pub mod providers;
pub mod sequence;
pub mod store;
pub mod types;
pub mod workflow;

/// Environment module - injected dependencies.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use waybill_flow_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// assert!(clock.now() <= chrono::Utc::now());
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use error::{DocumentError, StoreError};
pub use event::{DocumentEvent, EventEnvelope, EventKind, StateChange};
pub use workflow::{EntityKind, StateId, WorkflowDefinition};
