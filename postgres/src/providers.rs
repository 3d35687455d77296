//! Catalog lookup and loyalty ledger backed by `PostgreSQL` tables.

use crate::store::store_error;
use sqlx::PgPool;
use std::future::Future;
use std::pin::Pin;
use waybill_flow_core::providers::{
    AccrualOutcome, CatalogKind, CatalogLookup, PointsAccrual, PointsLedger, ProviderError,
};

fn unavailable(error: sqlx::Error) -> ProviderError {
    ProviderError::Unavailable(store_error(error).to_string())
}

/// Existence checks against the catalog mirror tables.
#[derive(Clone)]
pub struct PostgresCatalog {
    pool: PgPool,
}

impl PostgresCatalog {
    /// Create a catalog over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    const fn sql(kind: CatalogKind) -> &'static str {
        match kind {
            CatalogKind::Consignee => "SELECT EXISTS (SELECT 1 FROM consignees WHERE id = $1)",
            CatalogKind::Farm => "SELECT EXISTS (SELECT 1 FROM farms WHERE id = $1)",
            CatalogKind::Product => "SELECT EXISTS (SELECT 1 FROM products WHERE id = $1)",
            CatalogKind::Destination => "SELECT EXISTS (SELECT 1 FROM destinations WHERE id = $1)",
        }
    }
}

impl CatalogLookup for PostgresCatalog {
    fn exists(
        &self,
        kind: CatalogKind,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<bool, ProviderError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query_scalar(Self::sql(kind))
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(unavailable)
        })
    }
}

/// Loyalty points ledger keyed by idempotency key.
#[derive(Clone)]
pub struct PostgresPointsLedger {
    pool: PgPool,
}

impl PostgresPointsLedger {
    /// Create a ledger over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Unexpired points of a consignee at `at`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Unavailable`] if the query fails.
    pub async fn balance(
        &self,
        consignee_id: waybill_flow_core::types::ConsigneeId,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<i64, ProviderError> {
        sqlx::query_scalar(
            r"
            SELECT COALESCE(SUM(points), 0)::BIGINT
            FROM loyalty_points
            WHERE consignee_id = $1 AND expires_at > $2
            ",
        )
        .bind(consignee_id.get())
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)
    }
}

impl PointsLedger for PostgresPointsLedger {
    fn accrue(
        &self,
        accrual: PointsAccrual,
    ) -> Pin<Box<dyn Future<Output = Result<AccrualOutcome, ProviderError>> + Send + '_>> {
        Box::pin(async move {
            let inserted: Option<i64> = sqlx::query_scalar(
                r"
                INSERT INTO loyalty_points (consignee_id, points, reason, expires_at, idempotency_key)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (idempotency_key) DO NOTHING
                RETURNING id
                ",
            )
            .bind(accrual.account.get())
            .bind(accrual.points)
            .bind(&accrual.reason)
            .bind(accrual.expires_at)
            .bind(&accrual.idempotency_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

            Ok(match inserted {
                Some(_) => AccrualOutcome::Credited,
                None => {
                    tracing::debug!(key = %accrual.idempotency_key, "Accrual already recorded");
                    AccrualOutcome::AlreadyApplied
                },
            })
        })
    }
}
