//! # Waybill Flow Testing
//!
//! Testing utilities for the waybill document pipeline.
//!
//! This crate provides:
//! - [`InMemoryDocumentStore`]: transactional in-memory persistence
//! - [`InMemoryCatalog`] and [`InMemoryPointsLedger`]: collaborator fakes
//! - [`FixedClock`]: deterministic, manually advanced time
//! - [`TestHarness`]: a bootstrapped pipeline with fixtures
//!
//! ## Example
//!
//! ```ignore
//! use waybill_flow_testing::{TestHarness, fixtures};
//!
//! #[tokio::test]
//! async fn cut_credits_points() {
//!     let harness = TestHarness::new().await;
//!     let masters = harness.master_waybills(1).await;
//!     let record = harness.coordination(masters[0].id, &[3]).await;
//!     // ...
//! }
//! ```

use chrono::{DateTime, Utc};
use waybill_flow_core::environment::Clock;

/// Transactional in-memory store
pub mod store;

/// Catalog and ledger fakes
pub mod providers;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::{Arc, PoisonError, RwLock};
    use waybill_flow_core::event::{EventEnvelope, EventKind};
    use waybill_flow_runtime::{EventListener, ListenerError};

    /// Clock that only moves when told to.
    ///
    /// Clones share the same instant.
    ///
    /// # Example
    ///
    /// ```
    /// use waybill_flow_testing::mocks::FixedClock;
    /// use waybill_flow_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let before = clock.now();
    /// assert_eq!(before, clock.now());
    ///
    /// clock.advance(Duration::minutes(5));
    /// assert_eq!(clock.now() - before, Duration::minutes(5));
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a clock stopped at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.write().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.write().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Listener that keeps every envelope it receives.
    #[derive(Debug, Default)]
    pub struct RecordingListener {
        events: std::sync::Mutex<Vec<EventEnvelope>>,
    }

    impl RecordingListener {
        /// An empty recorder.
        #[must_use]
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Envelopes received so far, in delivery order.
        #[must_use]
        pub fn events(&self) -> Vec<EventEnvelope> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Kinds received so far, in delivery order.
        #[must_use]
        pub fn kinds(&self) -> Vec<EventKind> {
            self.events().iter().map(EventEnvelope::kind).collect()
        }
    }

    impl EventListener for RecordingListener {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn handle<'a>(
            &'a self,
            envelope: &'a EventEnvelope,
        ) -> Pin<Box<dyn Future<Output = Result<(), ListenerError>> + Send + 'a>> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(envelope.clone());
            Box::pin(std::future::ready(Ok(())))
        }
    }

    /// Create a default fixed clock for tests (2026-03-15 12:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2026-03-15T12:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Actors, requests and a bootstrapped pipeline.
pub mod fixtures {
    #![allow(clippy::unwrap_used)] // Fixtures fail the test on setup errors
    #![allow(clippy::missing_panics_doc)]

    use super::mocks::{FixedClock, test_clock};
    use super::providers::{InMemoryCatalog, InMemoryPointsLedger};
    use super::store::InMemoryDocumentStore;
    use chrono::NaiveDate;
    use std::sync::Arc;
    use std::time::Duration;
    use waybill_flow_core::constants::roles;
    use waybill_flow_core::types::{
        Actor, CarrierId, Charges, ConsigneeId, ConsigneeRequest, DestinationId, MasterWaybill,
        MasterWaybillId, PaymentMode, ProductId, WaybillBatch,
    };
    use waybill_flow_core::workflow::{EntityKind, StateId};
    use waybill_flow_runtime::{
        CoordinationView, CreateBatchRequest, CreateCoordination, RuntimeConfig, WaybillFlow,
    };

    /// Airline prefix used by fixture stock.
    pub const PREFIX: i32 = 145;
    /// First serial of fixture stock.
    pub const INITIAL_SERIAL: u64 = 10_000_011;
    /// Product used by fixture records.
    pub const PRODUCT: ProductId = ProductId::new(9);

    /// A user holding the admin role.
    #[must_use]
    pub fn admin() -> Actor {
        Actor::user("ana.admin", [roles::ADMIN])
    }

    /// A user holding the coordinator role.
    #[must_use]
    pub fn coordinator() -> Actor {
        Actor::user("carlos.coord", [roles::COORDINATOR])
    }

    /// A user holding the operator role.
    #[must_use]
    pub fn operator() -> Actor {
        Actor::user("olga.ops", [roles::OPERATOR])
    }

    /// A user with no roles at all.
    #[must_use]
    pub fn guest() -> Actor {
        Actor::user("guest", Vec::<String>::new())
    }

    /// Batch reference for fixture stock.
    #[must_use]
    pub fn batch() -> WaybillBatch {
        WaybillBatch {
            issued_on: NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
            carrier_id: CarrierId::new(1),
            agency_id: None,
            stock_tag: Some("LOT-A".into()),
        }
    }

    /// Consignee set with the first id as principal.
    #[must_use]
    pub fn consignees(ids: &[i64]) -> Vec<ConsigneeRequest> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| ConsigneeRequest {
                consignee_id: ConsigneeId::new(*id),
                is_principal: i == 0,
            })
            .collect()
    }

    /// A complete record request on `master`.
    #[must_use]
    pub fn create_request(master: MasterWaybillId, consignee_ids: &[i64]) -> CreateCoordination {
        CreateCoordination {
            master_waybill_id: master,
            product_id: PRODUCT,
            origin_destination_id: DestinationId::new(1),
            final_destination_id: DestinationId::new(2),
            payment_mode: PaymentMode::Prepaid,
            flight_date: NaiveDate::from_ymd_opt(2026, 3, 20).unwrap(),
            charges: Charges {
                rate_cents: 180_000,
                fuel_cents: 12_000,
                ..Charges::default()
            },
            observations: None,
            consignees: consignees(consignee_ids),
        }
    }

    /// A bootstrapped pipeline over in-memory adapters.
    pub struct TestHarness {
        /// Services under test.
        pub flow: WaybillFlow<InMemoryDocumentStore>,
        /// Backing store.
        pub store: InMemoryDocumentStore,
        /// Catalog fake.
        pub catalog: Arc<InMemoryCatalog>,
        /// Ledger fake.
        pub ledger: Arc<InMemoryPointsLedger>,
        /// Shared clock.
        pub clock: FixedClock,
    }

    impl TestHarness {
        /// Harness with default configuration and a permissive catalog.
        pub async fn new() -> Self {
            Self::with_config(RuntimeConfig::default()).await
        }

        /// Harness with custom configuration and a permissive catalog.
        pub async fn with_config(config: RuntimeConfig) -> Self {
            Self::build(config, InMemoryCatalog::allow_all()).await
        }

        /// Harness with custom configuration and catalog.
        pub async fn build(config: RuntimeConfig, catalog: InMemoryCatalog) -> Self {
            super::init_tracing();
            let store = InMemoryDocumentStore::new();
            let catalog = Arc::new(catalog);
            let ledger = Arc::new(InMemoryPointsLedger::new());
            let clock = test_clock();
            let flow = WaybillFlow::bootstrap(
                store.clone(),
                &config,
                catalog.clone(),
                ledger.clone(),
                Arc::new(clock.clone()),
            )
            .await
            .unwrap();
            Self {
                flow,
                store,
                catalog,
                ledger,
                clock,
            }
        }

        /// Register `count` waybills of fixture stock.
        pub async fn master_waybills(&self, count: usize) -> Vec<MasterWaybill> {
            self.flow
                .master_waybills
                .create_batch(CreateBatchRequest {
                    prefix: PREFIX,
                    initial: INITIAL_SERIAL,
                    count,
                    batch: batch(),
                    observations: None,
                    actor: admin(),
                })
                .await
                .unwrap()
        }

        /// Create a record on `master` for the given consignees.
        pub async fn coordination(&self, master: MasterWaybillId, consignee_ids: &[i64]) -> CoordinationView {
            self.flow
                .coordinations
                .create(create_request(master, consignee_ids), &coordinator())
                .await
                .unwrap()
        }

        /// State id by kind and name.
        #[must_use]
        pub fn state(&self, kind: EntityKind, name: &str) -> StateId {
            self.flow.engine.definition().require_state(kind, name).unwrap()
        }

        /// Wait until every dispatched event has been handled.
        pub async fn settle(&self) {
            assert!(
                self.flow
                    .dispatcher()
                    .wait_idle_timeout(Duration::from_secs(5))
                    .await,
                "listeners did not settle"
            );
        }
    }
}

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use fixtures::TestHarness;
pub use mocks::{FixedClock, RecordingListener, test_clock};
pub use providers::{InMemoryCatalog, InMemoryPointsLedger};
pub use store::InMemoryDocumentStore;
