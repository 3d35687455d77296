//! `PostgreSQL` document store.
//!
//! Each [`PostgresTx`] wraps one `sqlx` transaction. Entity reads use
//! `SELECT ... FOR UPDATE`, so two services racing on the same master waybill
//! or coordination record serialize on the row lock; the loser re-reads the
//! winner's committed state. Child numbering takes a transaction-scoped
//! advisory lock per numbering scope before reading the last issued sequence.
//!
//! # Example
//!
//! ```no_run
//! use waybill_flow_postgres::{PostgresConfig, PostgresDocumentStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresDocumentStore::connect(&PostgresConfig::from_env()?).await?;
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::PostgresConfig;
use crate::rows::{
    ChildWaybillRow, ConsigneeRow, CoordinationRow, HistoryRow, IssuedNumberRow, MasterWaybillRow,
    StateRow, TransitionRow, child_columns, coordination_columns, master_columns,
};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use waybill_flow_core::StoreError;
use waybill_flow_core::numbering::NumberingScope;
use waybill_flow_core::store::{DocumentStore, DocumentTx, WorkflowRows};
use waybill_flow_core::types::{
    AgencyId, ChildWaybill, ChildWaybillId, ConsigneeAssignment, ConsigneeRequest, CoordinationId,
    CoordinationRecord, HistoryId, MasterWaybill, MasterWaybillId, NewChildWaybill,
    NewCoordination, NewMasterWaybill,
};
use waybill_flow_core::workflow::{
    EntityKind, NewStateHistory, StateDefinition, StateHistoryEntry, StateId, TransitionDefinition,
};

/// Map a driver error onto the store taxonomy.
///
/// Unique violations keep their constraint name; serialization failures and
/// deadlocks become retryable conflicts.
pub(crate) fn store_error(error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::UniqueViolation {
            constraint: db.constraint().unwrap_or("unknown").to_string(),
        },
        sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("40001" | "40P01")) => {
            StoreError::Conflict(db.message().to_string())
        },
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Decode(error.to_string())
        },
        _ => StoreError::Database(error.to_string()),
    }
}

const fn table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::MasterWaybill => "master_waybills",
        EntityKind::Coordination => "coordinations",
        EntityKind::ChildWaybill => "child_waybills",
    }
}

/// `PostgreSQL`-backed [`DocumentStore`].
#[derive(Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
}

impl PostgresDocumentStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool with `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the database cannot be reached.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = config.connect().await.map_err(store_error)?;
        tracing::info!(max_connections = config.max_connections, "Connected to PostgreSQL");
        Ok(Self::from_pool(pool))
    }

    /// Apply the bundled migrations, including the standard workflow seed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl DocumentStore for PostgresDocumentStore {
    type Tx = PostgresTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self.pool.begin().await.map_err(store_error)?;
        Ok(PostgresTx { tx })
    }

    async fn load_workflow(&self) -> Result<WorkflowRows, StoreError> {
        let states = sqlx::query_as::<_, StateRow>(
            r"
            SELECT id, name, entity_kind, is_initial, is_final, description, color
            FROM workflow_states
            ORDER BY id
            ",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?
        .into_iter()
        .map(TryInto::try_into)
        .collect::<Result<Vec<StateDefinition>, StoreError>>()?;

        let transitions = sqlx::query_as::<_, TransitionRow>(
            r"
            SELECT entity_kind, from_state_id, to_state_id, allowed_roles, requires_comment, action
            FROM workflow_transitions
            ORDER BY entity_kind, from_state_id, to_state_id
            ",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?
        .into_iter()
        .map(TryInto::try_into)
        .collect::<Result<Vec<TransitionDefinition>, StoreError>>()?;

        tracing::debug!(states = states.len(), transitions = transitions.len(), "Workflow tables loaded");
        Ok(WorkflowRows { states, transitions })
    }
}

/// One `PostgreSQL` transaction. Dropping it without [`commit`](DocumentTx::commit)
/// rolls back.
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

impl DocumentTx for PostgresTx {
    async fn current_state(&mut self, kind: EntityKind, entity_id: i64) -> Result<Option<StateId>, StoreError> {
        let sql = format!("SELECT current_state_id FROM {} WHERE id = $1 FOR UPDATE", table(kind));
        let state: Option<i64> = sqlx::query_scalar(&sql)
            .bind(entity_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(store_error)?;
        Ok(state.map(StateId::new))
    }

    async fn set_current_state(
        &mut self,
        kind: EntityKind,
        entity_id: i64,
        state: StateId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET current_state_id = $1, updated_at = $2 WHERE id = $3",
            table(kind)
        );
        let result = sqlx::query(&sql)
            .bind(state.get())
            .bind(at)
            .bind(entity_id)
            .execute(&mut *self.tx)
            .await
            .map_err(store_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Database(format!("{kind} {entity_id} does not exist")));
        }
        Ok(())
    }

    async fn append_history(&mut self, entry: NewStateHistory) -> Result<HistoryId, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO state_history (entity_kind, entity_id, state_id, actor_id, comment, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            ",
        )
        .bind(entry.entity_kind.as_str())
        .bind(entry.entity_id)
        .bind(entry.state_id.get())
        .bind(entry.actor_id.as_str())
        .bind(entry.comment.as_deref())
        .bind(entry.recorded_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(store_error)?;
        Ok(HistoryId::new(id))
    }

    async fn history(&mut self, kind: EntityKind, entity_id: i64) -> Result<Vec<StateHistoryEntry>, StoreError> {
        sqlx::query_as::<_, HistoryRow>(
            r"
            SELECT id, entity_kind, entity_id, state_id, actor_id, comment, recorded_at
            FROM state_history
            WHERE entity_kind = $1 AND entity_id = $2
            ORDER BY id
            ",
        )
        .bind(kind.as_str())
        .bind(entity_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(store_error)?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
    }

    async fn get_master_waybill(&mut self, id: MasterWaybillId) -> Result<Option<MasterWaybill>, StoreError> {
        let row = sqlx::query_as::<_, MasterWaybillRow>(concat!(
            "SELECT ",
            master_columns!(),
            " FROM master_waybills WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(store_error)?;
        Ok(row.map(Into::into))
    }

    async fn master_waybill_exists(&mut self, prefix: i32, sequence: i64) -> Result<bool, StoreError> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM master_waybills WHERE prefix = $1 AND sequence = $2)")
            .bind(prefix)
            .bind(sequence)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(store_error)
    }

    async fn insert_master_waybill(&mut self, waybill: NewMasterWaybill) -> Result<MasterWaybillId, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO master_waybills (
                prefix, sequence, issued_on, carrier_id, agency_id, stock_tag,
                current_state_id, observations, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            RETURNING id
            ",
        )
        .bind(waybill.prefix)
        .bind(waybill.sequence)
        .bind(waybill.batch.issued_on)
        .bind(waybill.batch.carrier_id.get())
        .bind(waybill.batch.agency_id.map(AgencyId::get))
        .bind(waybill.batch.stock_tag)
        .bind(waybill.state.get())
        .bind(waybill.observations)
        .bind(waybill.created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(store_error)?;
        Ok(MasterWaybillId::new(id))
    }

    async fn update_master_waybill(&mut self, waybill: &MasterWaybill) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE master_waybills SET
                issued_on = $2, carrier_id = $3, agency_id = $4, stock_tag = $5,
                on_loan = $6, loaned_on = $7, returned = $8, returned_on = $9,
                observations = $10, updated_at = $11
            WHERE id = $1
            ",
        )
        .bind(waybill.id.get())
        .bind(waybill.batch.issued_on)
        .bind(waybill.batch.carrier_id.get())
        .bind(waybill.batch.agency_id.map(AgencyId::get))
        .bind(waybill.batch.stock_tag.as_deref())
        .bind(waybill.on_loan)
        .bind(waybill.loaned_on)
        .bind(waybill.returned)
        .bind(waybill.returned_on)
        .bind(waybill.observations.as_deref())
        .bind(waybill.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn active_coordination_for(
        &mut self,
        master_waybill_id: MasterWaybillId,
        final_states: &[StateId],
    ) -> Result<Option<CoordinationId>, StoreError> {
        let finals: Vec<i64> = final_states.iter().map(|s| s.get()).collect();
        let id: Option<i64> = sqlx::query_scalar(
            r"
            SELECT id FROM coordinations
            WHERE master_waybill_id = $1 AND NOT (current_state_id = ANY($2))
            ORDER BY id
            LIMIT 1
            FOR UPDATE
            ",
        )
        .bind(master_waybill_id.get())
        .bind(finals)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(store_error)?;
        Ok(id.map(CoordinationId::new))
    }

    async fn insert_coordination(&mut self, record: NewCoordination) -> Result<CoordinationId, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO coordinations (
                master_waybill_id, product_id, origin_destination_id, final_destination_id,
                payment_mode, flight_date, rate_cents, fuel_cents, security_cents,
                handling_cents, other_charges_cents, observations, current_state_id,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
            RETURNING id
            ",
        )
        .bind(record.master_waybill_id.get())
        .bind(record.product_id.get())
        .bind(record.origin_destination_id.get())
        .bind(record.final_destination_id.get())
        .bind(record.payment_mode.as_str())
        .bind(record.flight_date)
        .bind(record.charges.rate_cents)
        .bind(record.charges.fuel_cents)
        .bind(record.charges.security_cents)
        .bind(record.charges.handling_cents)
        .bind(record.charges.other_charges_cents)
        .bind(record.observations)
        .bind(record.state.get())
        .bind(record.created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(store_error)?;
        Ok(CoordinationId::new(id))
    }

    async fn get_coordination(&mut self, id: CoordinationId) -> Result<Option<CoordinationRecord>, StoreError> {
        sqlx::query_as::<_, CoordinationRow>(concat!(
            "SELECT ",
            coordination_columns!(),
            " FROM coordinations WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(store_error)?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn update_coordination(&mut self, record: &CoordinationRecord) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE coordinations SET
                product_id = $2, origin_destination_id = $3, final_destination_id = $4,
                payment_mode = $5, flight_date = $6, rate_cents = $7, fuel_cents = $8,
                security_cents = $9, handling_cents = $10, other_charges_cents = $11,
                observations = $12, updated_at = $13
            WHERE id = $1
            ",
        )
        .bind(record.id.get())
        .bind(record.product_id.get())
        .bind(record.origin_destination_id.get())
        .bind(record.final_destination_id.get())
        .bind(record.payment_mode.as_str())
        .bind(record.flight_date)
        .bind(record.charges.rate_cents)
        .bind(record.charges.fuel_cents)
        .bind(record.charges.security_cents)
        .bind(record.charges.handling_cents)
        .bind(record.charges.other_charges_cents)
        .bind(record.observations.as_deref())
        .bind(record.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn replace_consignees(
        &mut self,
        id: CoordinationId,
        consignees: &[ConsigneeRequest],
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM coordination_consignees WHERE coordination_id = $1")
            .bind(id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(store_error)?;

        let ids: Vec<i64> = consignees.iter().map(|c| c.consignee_id.get()).collect();
        let principals: Vec<bool> = consignees.iter().map(|c| c.is_principal).collect();
        sqlx::query(
            r"
            INSERT INTO coordination_consignees (coordination_id, consignee_id, is_principal)
            SELECT $1, consignee_id, is_principal
            FROM UNNEST($2::BIGINT[], $3::BOOLEAN[]) AS c (consignee_id, is_principal)
            ",
        )
        .bind(id.get())
        .bind(ids)
        .bind(principals)
        .execute(&mut *self.tx)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn consignees(&mut self, id: CoordinationId) -> Result<Vec<ConsigneeAssignment>, StoreError> {
        let rows = sqlx::query_as::<_, ConsigneeRow>(
            r"
            SELECT coordination_id, consignee_id, is_principal
            FROM coordination_consignees
            WHERE coordination_id = $1
            ORDER BY is_principal DESC, consignee_id
            ",
        )
        .bind(id.get())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(store_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn find_child_by_key(&mut self, dedup_key: &str) -> Result<Option<ChildWaybill>, StoreError> {
        sqlx::query_as::<_, ChildWaybillRow>(concat!(
            "SELECT ",
            child_columns!(),
            " FROM child_waybills WHERE dedup_key = $1 FOR UPDATE"
        ))
        .bind(dedup_key)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(store_error)?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn insert_child(&mut self, child: NewChildWaybill) -> Result<ChildWaybillId, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO child_waybills (
                coordination_id, master_waybill_id, farm_id, product_id, consignee_id,
                full_boxes, pieces, weight_kg, stems, number, number_format, year,
                sequence, dedup_key, current_state_id, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $16)
            RETURNING id
            ",
        )
        .bind(child.coordination_id.get())
        .bind(child.master_waybill_id.get())
        .bind(child.farm_id.get())
        .bind(child.product_id.get())
        .bind(child.consignee_id.get())
        .bind(child.quantities.full_boxes)
        .bind(child.quantities.pieces)
        .bind(child.quantities.weight_kg)
        .bind(child.quantities.stems)
        .bind(child.number)
        .bind(child.number_format.as_str())
        .bind(child.year)
        .bind(i64::from(child.sequence))
        .bind(child.dedup_key)
        .bind(child.state.get())
        .bind(child.created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(store_error)?;
        Ok(ChildWaybillId::new(id))
    }

    async fn update_child(&mut self, child: &ChildWaybill) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE child_waybills SET
                coordination_id = $2, master_waybill_id = $3, farm_id = $4, product_id = $5,
                consignee_id = $6, full_boxes = $7, pieces = $8, weight_kg = $9, stems = $10,
                dedup_key = $11, updated_at = $12
            WHERE id = $1
            ",
        )
        .bind(child.id.get())
        .bind(child.coordination_id.get())
        .bind(child.master_waybill_id.get())
        .bind(child.farm_id.get())
        .bind(child.product_id.get())
        .bind(child.consignee_id.get())
        .bind(child.quantities.full_boxes)
        .bind(child.quantities.pieces)
        .bind(child.quantities.weight_kg)
        .bind(child.quantities.stems)
        .bind(child.dedup_key.as_str())
        .bind(child.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn get_child(&mut self, id: ChildWaybillId) -> Result<Option<ChildWaybill>, StoreError> {
        sqlx::query_as::<_, ChildWaybillRow>(concat!(
            "SELECT ",
            child_columns!(),
            " FROM child_waybills WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(store_error)?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn children_of(&mut self, coordination_id: CoordinationId) -> Result<Vec<ChildWaybill>, StoreError> {
        sqlx::query_as::<_, ChildWaybillRow>(concat!(
            "SELECT ",
            child_columns!(),
            " FROM child_waybills WHERE coordination_id = $1 ORDER BY id"
        ))
        .bind(coordination_id.get())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(store_error)?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
    }

    async fn last_issued_sequence(&mut self, scope: &NumberingScope) -> Result<Option<u32>, StoreError> {
        // Held until commit, so concurrent allocations in one scope queue here.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(scope.to_string())
            .execute(&mut *self.tx)
            .await
            .map_err(store_error)?;

        let rows = sqlx::query_as::<_, IssuedNumberRow>(
            r"
            SELECT number, year, sequence
            FROM child_waybills
            WHERE number_format = $1 AND ($2::INTEGER IS NULL OR year = $2)
            ORDER BY sequence DESC
            ",
        )
        .bind(scope.format_kind().as_str())
        .bind(scope.year())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(store_error)?;

        let kind = scope.format_kind();
        for row in rows {
            if scope.contains(kind, row.year, &row.number) {
                return row.sequence().map(Some);
            }
        }
        Ok(None)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(store_error)
    }
}
