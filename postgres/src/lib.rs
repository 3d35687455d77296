//! `PostgreSQL` adapters for the waybill document pipeline.
//!
//! This crate provides the production implementations of the persistence and
//! collaborator traits from `waybill-flow-core`:
//!
//! - [`PostgresDocumentStore`]: transactional [`DocumentStore`] with row locks
//! - [`PostgresCatalog`]: [`CatalogLookup`] over catalog mirror tables
//! - [`PostgresPointsLedger`]: idempotent [`PointsLedger`]
//!
//! Migrations under `migrations/` create the schema and seed the standard
//! workflow configuration.
//!
//! # Example
//!
//! ```ignore
//! use waybill_flow_postgres::{PostgresCatalog, PostgresConfig, PostgresDocumentStore, PostgresPointsLedger};
//!
//! let store = PostgresDocumentStore::connect(&PostgresConfig::from_env()?).await?;
//! store.migrate().await?;
//! let catalog = PostgresCatalog::new(store.pool().clone());
//! let ledger = PostgresPointsLedger::new(store.pool().clone());
//! ```
//!
//! [`DocumentStore`]: waybill_flow_core::store::DocumentStore
//! [`CatalogLookup`]: waybill_flow_core::providers::CatalogLookup
//! [`PointsLedger`]: waybill_flow_core::providers::PointsLedger

mod config;
mod providers;
mod rows;
mod store;

pub use config::{PostgresConfig, PostgresConfigError};
pub use providers::{PostgresCatalog, PostgresPointsLedger};
pub use store::{PostgresDocumentStore, PostgresTx};
