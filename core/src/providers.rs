//! Collaborators outside the document store.
//!
//! Catalog services own airlines, airports, customers, farms and products; the
//! points ledger owns loyalty balances. Both are consulted through
//! dyn-compatible traits so services and listeners can hold them as
//! `Arc<dyn ...>`.

use crate::types::ConsigneeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Catalog entity types the document services reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CatalogKind {
    /// Customer receiving cargo.
    Consignee,
    /// Shipping farm.
    Farm,
    /// Product (flower variety).
    Product,
    /// Airport or final destination.
    Destination,
}

impl CatalogKind {
    /// Entity name used in errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Consignee => "consignee",
            Self::Farm => "farm",
            Self::Product => "product",
            Self::Destination => "destination",
        }
    }
}

impl fmt::Display for CatalogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from external collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The collaborator could not be reached or failed.
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// The collaborator rejected the request.
    #[error("Provider rejected request: {0}")]
    Rejected(String),
}

/// Existence checks against the catalogs.
pub trait CatalogLookup: Send + Sync {
    /// Whether the catalog entity exists.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the catalog cannot be consulted.
    fn exists(
        &self,
        kind: CatalogKind,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<bool, ProviderError>> + Send + '_>>;
}

/// A loyalty points credit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsAccrual {
    /// Credited consignee account.
    pub account: ConsigneeId,
    /// Points to credit.
    pub points: i64,
    /// Ledger description.
    pub reason: String,
    /// When the points expire.
    pub expires_at: DateTime<Utc>,
    /// Key under which repeated accruals are ignored.
    pub idempotency_key: String,
}

/// Outcome of an accrual.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccrualOutcome {
    /// Points were credited.
    Credited,
    /// The idempotency key was already used; nothing changed.
    AlreadyApplied,
}

/// Loyalty points ledger.
pub trait PointsLedger: Send + Sync {
    /// Credit points, at most once per idempotency key.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the ledger rejects or cannot store the credit.
    fn accrue(
        &self,
        accrual: PointsAccrual,
    ) -> Pin<Box<dyn Future<Output = Result<AccrualOutcome, ProviderError>> + Send + '_>>;
}
