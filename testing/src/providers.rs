//! In-memory catalog and points ledger.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use waybill_flow_core::providers::{
    AccrualOutcome, CatalogKind, CatalogLookup, PointsAccrual, PointsLedger, ProviderError,
};
use waybill_flow_core::types::ConsigneeId;

/// Catalog backed by a set of known `(kind, id)` pairs.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    entries: Mutex<HashSet<(CatalogKind, i64)>>,
    allow_all: bool,
    unavailable: AtomicBool,
}

impl InMemoryCatalog {
    /// An empty catalog; every lookup misses until entries are inserted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog in which every entity exists.
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            ..Self::default()
        }
    }

    /// Register entities.
    pub fn insert(&self, kind: CatalogKind, ids: impl IntoIterator<Item = i64>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.extend(ids.into_iter().map(|id| (kind, id)));
    }

    /// Make every lookup fail with [`ProviderError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl CatalogLookup for InMemoryCatalog {
    fn exists(
        &self,
        kind: CatalogKind,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<bool, ProviderError>> + Send + '_>> {
        Box::pin(async move {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(ProviderError::Unavailable("catalog offline".into()));
            }
            if self.allow_all {
                return Ok(true);
            }
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(entries.contains(&(kind, id)))
        })
    }
}

#[derive(Debug, Default)]
struct Ledger {
    applied: HashSet<String>,
    accruals: Vec<PointsAccrual>,
}

/// Ledger that records credits and honours idempotency keys.
#[derive(Debug, Default)]
pub struct InMemoryPointsLedger {
    ledger: Mutex<Ledger>,
    failing: AtomicBool,
}

impl InMemoryPointsLedger {
    /// An empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Credits applied so far, in order.
    #[must_use]
    pub fn accruals(&self) -> Vec<PointsAccrual> {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .accruals
            .clone()
    }

    /// Total points credited to `account`.
    #[must_use]
    pub fn balance(&self, account: ConsigneeId) -> i64 {
        self.accruals()
            .iter()
            .filter(|a| a.account == account)
            .map(|a| a.points)
            .sum()
    }

    /// Balances of every credited account.
    #[must_use]
    pub fn balances(&self) -> HashMap<ConsigneeId, i64> {
        let mut balances = HashMap::new();
        for accrual in self.accruals() {
            *balances.entry(accrual.account).or_insert(0) += accrual.points;
        }
        balances
    }

    /// Make every credit fail with [`ProviderError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl PointsLedger for InMemoryPointsLedger {
    fn accrue(
        &self,
        accrual: PointsAccrual,
    ) -> Pin<Box<dyn Future<Output = Result<AccrualOutcome, ProviderError>> + Send + '_>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ProviderError::Unavailable("ledger offline".into()));
            }
            let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
            if !ledger.applied.insert(accrual.idempotency_key.clone()) {
                return Ok(AccrualOutcome::AlreadyApplied);
            }
            ledger.accruals.push(accrual);
            Ok(AccrualOutcome::Credited)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn accrual(key: &str, points: i64) -> PointsAccrual {
        PointsAccrual {
            account: ConsigneeId::new(3),
            points,
            reason: "test".into(),
            expires_at: Utc::now(),
            idempotency_key: key.into(),
        }
    }

    #[tokio::test]
    async fn ledger_applies_each_key_once() {
        let ledger = InMemoryPointsLedger::new();
        assert_eq!(ledger.accrue(accrual("a", 30)).await.unwrap(), AccrualOutcome::Credited);
        assert_eq!(
            ledger.accrue(accrual("a", 30)).await.unwrap(),
            AccrualOutcome::AlreadyApplied
        );
        assert_eq!(ledger.accrue(accrual("b", 5)).await.unwrap(), AccrualOutcome::Credited);
        assert_eq!(ledger.balance(ConsigneeId::new(3)), 35);
    }

    #[tokio::test]
    async fn catalog_reports_known_entities() {
        let catalog = InMemoryCatalog::new();
        catalog.insert(CatalogKind::Farm, [7]);
        assert!(catalog.exists(CatalogKind::Farm, 7).await.unwrap());
        assert!(!catalog.exists(CatalogKind::Product, 7).await.unwrap());

        catalog.set_unavailable(true);
        assert!(catalog.exists(CatalogKind::Farm, 7).await.is_err());
    }
}
