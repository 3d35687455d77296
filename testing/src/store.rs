//! In-memory document store.
//!
//! A transaction takes the table lock for its whole lifetime and works on a
//! copy of the tables; commit writes the copy back and dropping discards it.
//! Transactions are therefore fully serialized, which is stricter than row
//! locking but gives the same observable outcomes for the service tests.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};
use waybill_flow_core::error::StoreError;
use waybill_flow_core::numbering::NumberingScope;
use waybill_flow_core::store::{DocumentStore, DocumentTx, WorkflowRows};
use waybill_flow_core::types::{
    ChildWaybill, ChildWaybillId, ConsigneeAssignment, ConsigneeRequest, CoordinationId,
    CoordinationRecord, HistoryId, MasterWaybill, MasterWaybillId, NewChildWaybill,
    NewCoordination, NewMasterWaybill,
};
use waybill_flow_core::workflow::{
    EntityKind, NewStateHistory, StateHistoryEntry, StateId, standard_rows,
};

/// Every table the store holds.
#[derive(Clone, Debug, Default)]
pub struct Tables {
    /// Master waybills by id.
    pub master_waybills: BTreeMap<MasterWaybillId, MasterWaybill>,
    /// Coordination records by id.
    pub coordinations: BTreeMap<CoordinationId, CoordinationRecord>,
    /// Consignee join rows by record.
    pub consignees: BTreeMap<CoordinationId, Vec<ConsigneeAssignment>>,
    /// Child waybills by id.
    pub children: BTreeMap<ChildWaybillId, ChildWaybill>,
    /// State history in insertion order.
    pub history: Vec<StateHistoryEntry>,
    last_id: i64,
}

impl Tables {
    const fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

/// HashMap-backed [`DocumentStore`] for fast, deterministic tests.
///
/// # Example
///
/// ```
/// use waybill_flow_testing::InMemoryDocumentStore;
/// use waybill_flow_core::store::{DocumentStore, DocumentTx};
/// use waybill_flow_core::types::MasterWaybillId;
///
/// # tokio_test::block_on(async {
/// let store = InMemoryDocumentStore::new();
/// let mut tx = store.begin().await.unwrap();
/// assert!(tx.get_master_waybill(MasterWaybillId::new(1)).await.unwrap().is_none());
/// # });
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryDocumentStore {
    tables: Arc<Mutex<Tables>>,
    workflow: Arc<WorkflowRows>,
    commits: Arc<AtomicUsize>,
    preempted_inserts: Arc<AtomicUsize>,
}

impl InMemoryDocumentStore {
    /// An empty store seeded with the standard workflow.
    #[must_use]
    pub fn new() -> Self {
        let (states, transitions) = standard_rows();
        Self::with_workflow(WorkflowRows {
            states,
            transitions,
        })
    }

    /// An empty store serving custom workflow tables.
    #[must_use]
    pub fn with_workflow(workflow: WorkflowRows) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            workflow: Arc::new(workflow),
            commits: Arc::new(AtomicUsize::new(0)),
            preempted_inserts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Copy of the committed tables.
    pub async fn snapshot(&self) -> Tables {
        self.tables.lock().await.clone()
    }

    /// Number of committed transactions.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Make the next `count` child inserts lose a race: a competing writer
    /// commits the same row first and the insert reports a unique violation.
    pub fn preempt_child_inserts(&self, count: usize) {
        self.preempted_inserts.store(count, Ordering::SeqCst);
    }

    fn take_preemption(&self) -> bool {
        self.preempted_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for InMemoryDocumentStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx, StoreError> {
        let committed = Arc::clone(&self.tables).lock_owned().await;
        let work = committed.clone();
        Ok(InMemoryTx {
            committed,
            work,
            store: self.clone(),
        })
    }

    async fn load_workflow(&self) -> Result<WorkflowRows, StoreError> {
        Ok(self.workflow.as_ref().clone())
    }
}

/// Transaction over [`InMemoryDocumentStore`].
pub struct InMemoryTx {
    committed: OwnedMutexGuard<Tables>,
    work: Tables,
    store: InMemoryDocumentStore,
}

fn missing(kind: &str, id: i64) -> StoreError {
    StoreError::Database(format!("{kind} {id} does not exist"))
}

fn child_from(id: ChildWaybillId, row: NewChildWaybill) -> ChildWaybill {
    ChildWaybill {
        id,
        coordination_id: row.coordination_id,
        master_waybill_id: row.master_waybill_id,
        farm_id: row.farm_id,
        product_id: row.product_id,
        consignee_id: row.consignee_id,
        quantities: row.quantities,
        number: row.number,
        number_format: row.number_format,
        year: row.year,
        sequence: row.sequence,
        dedup_key: row.dedup_key,
        current_state: row.state,
        created_at: row.created_at,
        updated_at: row.created_at,
    }
}

impl DocumentTx for InMemoryTx {
    async fn current_state(
        &mut self,
        kind: EntityKind,
        entity_id: i64,
    ) -> Result<Option<StateId>, StoreError> {
        let t = &self.work;
        Ok(match kind {
            EntityKind::MasterWaybill => t
                .master_waybills
                .get(&MasterWaybillId::new(entity_id))
                .map(|w| w.current_state),
            EntityKind::Coordination => t
                .coordinations
                .get(&CoordinationId::new(entity_id))
                .map(|r| r.current_state),
            EntityKind::ChildWaybill => t
                .children
                .get(&ChildWaybillId::new(entity_id))
                .map(|c| c.current_state),
        })
    }

    async fn set_current_state(
        &mut self,
        kind: EntityKind,
        entity_id: i64,
        state: StateId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let t = &mut self.work;
        let (current, updated) = match kind {
            EntityKind::MasterWaybill => t
                .master_waybills
                .get_mut(&MasterWaybillId::new(entity_id))
                .map(|w| (&mut w.current_state, &mut w.updated_at)),
            EntityKind::Coordination => t
                .coordinations
                .get_mut(&CoordinationId::new(entity_id))
                .map(|r| (&mut r.current_state, &mut r.updated_at)),
            EntityKind::ChildWaybill => t
                .children
                .get_mut(&ChildWaybillId::new(entity_id))
                .map(|c| (&mut c.current_state, &mut c.updated_at)),
        }
        .ok_or_else(|| missing(kind.as_str(), entity_id))?;
        *current = state;
        *updated = at;
        Ok(())
    }

    async fn append_history(&mut self, entry: NewStateHistory) -> Result<HistoryId, StoreError> {
        let id = HistoryId::new(self.work.next_id());
        self.work.history.push(StateHistoryEntry {
            id,
            entity_kind: entry.entity_kind,
            entity_id: entry.entity_id,
            state_id: entry.state_id,
            actor_id: entry.actor_id,
            comment: entry.comment,
            recorded_at: entry.recorded_at,
        });
        Ok(id)
    }

    async fn history(
        &mut self,
        kind: EntityKind,
        entity_id: i64,
    ) -> Result<Vec<StateHistoryEntry>, StoreError> {
        Ok(self
            .work
            .history
            .iter()
            .filter(|h| h.entity_kind == kind && h.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn get_master_waybill(
        &mut self,
        id: MasterWaybillId,
    ) -> Result<Option<MasterWaybill>, StoreError> {
        Ok(self.work.master_waybills.get(&id).cloned())
    }

    async fn master_waybill_exists(&mut self, prefix: i32, sequence: i64) -> Result<bool, StoreError> {
        Ok(self
            .work
            .master_waybills
            .values()
            .any(|w| w.prefix == prefix && w.sequence == sequence))
    }

    async fn insert_master_waybill(
        &mut self,
        waybill: NewMasterWaybill,
    ) -> Result<MasterWaybillId, StoreError> {
        if self.master_waybill_exists(waybill.prefix, waybill.sequence).await? {
            return Err(StoreError::UniqueViolation {
                constraint: "master_waybills_prefix_sequence_key".into(),
            });
        }
        let id = MasterWaybillId::new(self.work.next_id());
        self.work.master_waybills.insert(
            id,
            MasterWaybill {
                id,
                prefix: waybill.prefix,
                sequence: waybill.sequence,
                batch: waybill.batch,
                current_state: waybill.state,
                on_loan: false,
                loaned_on: None,
                returned: false,
                returned_on: None,
                observations: waybill.observations,
                created_at: waybill.created_at,
                updated_at: waybill.created_at,
            },
        );
        Ok(id)
    }

    async fn update_master_waybill(&mut self, waybill: &MasterWaybill) -> Result<(), StoreError> {
        let stored = self
            .work
            .master_waybills
            .get_mut(&waybill.id)
            .ok_or_else(|| missing("master_waybill", waybill.id.get()))?;
        let current_state = stored.current_state;
        *stored = waybill.clone();
        stored.current_state = current_state;
        Ok(())
    }

    async fn active_coordination_for(
        &mut self,
        master_waybill_id: MasterWaybillId,
        final_states: &[StateId],
    ) -> Result<Option<CoordinationId>, StoreError> {
        Ok(self
            .work
            .coordinations
            .values()
            .find(|r| {
                r.master_waybill_id == master_waybill_id && !final_states.contains(&r.current_state)
            })
            .map(|r| r.id))
    }

    async fn insert_coordination(&mut self, record: NewCoordination) -> Result<CoordinationId, StoreError> {
        let id = CoordinationId::new(self.work.next_id());
        self.work.coordinations.insert(
            id,
            CoordinationRecord {
                id,
                master_waybill_id: record.master_waybill_id,
                product_id: record.product_id,
                origin_destination_id: record.origin_destination_id,
                final_destination_id: record.final_destination_id,
                payment_mode: record.payment_mode,
                flight_date: record.flight_date,
                charges: record.charges,
                observations: record.observations,
                current_state: record.state,
                created_at: record.created_at,
                updated_at: record.created_at,
            },
        );
        Ok(id)
    }

    async fn get_coordination(
        &mut self,
        id: CoordinationId,
    ) -> Result<Option<CoordinationRecord>, StoreError> {
        Ok(self.work.coordinations.get(&id).cloned())
    }

    async fn update_coordination(&mut self, record: &CoordinationRecord) -> Result<(), StoreError> {
        let stored = self
            .work
            .coordinations
            .get_mut(&record.id)
            .ok_or_else(|| missing("coordination", record.id.get()))?;
        let current_state = stored.current_state;
        *stored = record.clone();
        stored.current_state = current_state;
        Ok(())
    }

    async fn replace_consignees(
        &mut self,
        id: CoordinationId,
        consignees: &[ConsigneeRequest],
    ) -> Result<(), StoreError> {
        if !self.work.coordinations.contains_key(&id) {
            return Err(missing("coordination", id.get()));
        }
        let rows = consignees
            .iter()
            .map(|c| ConsigneeAssignment {
                coordination_id: id,
                consignee_id: c.consignee_id,
                is_principal: c.is_principal,
            })
            .collect();
        self.work.consignees.insert(id, rows);
        Ok(())
    }

    async fn consignees(&mut self, id: CoordinationId) -> Result<Vec<ConsigneeAssignment>, StoreError> {
        let mut rows = self.work.consignees.get(&id).cloned().unwrap_or_default();
        rows.sort_by_key(|c| (!c.is_principal, c.consignee_id));
        Ok(rows)
    }

    async fn find_child_by_key(&mut self, dedup_key: &str) -> Result<Option<ChildWaybill>, StoreError> {
        Ok(self
            .work
            .children
            .values()
            .find(|c| c.dedup_key == dedup_key)
            .cloned())
    }

    async fn insert_child(&mut self, child: NewChildWaybill) -> Result<ChildWaybillId, StoreError> {
        let violation = || StoreError::UniqueViolation {
            constraint: "child_waybills_dedup_key_key".into(),
        };

        if self.store.take_preemption() {
            let id = ChildWaybillId::new(self.committed.next_id());
            self.committed.children.insert(id, child_from(id, child));
            return Err(violation());
        }

        if self.find_child_by_key(&child.dedup_key).await?.is_some() {
            return Err(violation());
        }
        let id = ChildWaybillId::new(self.work.next_id());
        self.work.children.insert(id, child_from(id, child));
        Ok(id)
    }

    async fn update_child(&mut self, child: &ChildWaybill) -> Result<(), StoreError> {
        if self
            .work
            .children
            .values()
            .any(|c| c.id != child.id && c.dedup_key == child.dedup_key)
        {
            return Err(StoreError::UniqueViolation {
                constraint: "child_waybills_dedup_key_key".into(),
            });
        }
        let stored = self
            .work
            .children
            .get_mut(&child.id)
            .ok_or_else(|| missing("child_waybill", child.id.get()))?;
        let current_state = stored.current_state;
        *stored = child.clone();
        stored.current_state = current_state;
        Ok(())
    }

    async fn get_child(&mut self, id: ChildWaybillId) -> Result<Option<ChildWaybill>, StoreError> {
        Ok(self.work.children.get(&id).cloned())
    }

    async fn children_of(
        &mut self,
        coordination_id: CoordinationId,
    ) -> Result<Vec<ChildWaybill>, StoreError> {
        Ok(self
            .work
            .children
            .values()
            .filter(|c| c.coordination_id == coordination_id)
            .cloned()
            .collect())
    }

    async fn last_issued_sequence(&mut self, scope: &NumberingScope) -> Result<Option<u32>, StoreError> {
        Ok(self
            .work
            .children
            .values()
            .filter(|c| scope.contains(c.number_format, c.year, &c.number))
            .map(|c| c.sequence)
            .max())
    }

    async fn commit(self) -> Result<(), StoreError> {
        let Self {
            mut committed,
            work,
            store,
        } = self;
        *committed = work;
        store.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waybill_flow_core::types::{CarrierId, WaybillBatch};

    fn waybill(sequence: i64) -> NewMasterWaybill {
        NewMasterWaybill {
            prefix: 145,
            sequence,
            batch: WaybillBatch {
                issued_on: chrono::NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
                carrier_id: CarrierId::new(1),
                agency_id: None,
                stock_tag: None,
            },
            state: StateId::new(1),
            observations: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn uncommitted_writes_roll_back() {
        let store = InMemoryDocumentStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_master_waybill(waybill(1)).await.unwrap();
        }
        assert!(store.snapshot().await.master_waybills.is_empty());
        assert_eq!(store.commit_count(), 0);

        let mut tx = store.begin().await.unwrap();
        tx.insert_master_waybill(waybill(1)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.snapshot().await.master_waybills.len(), 1);
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_master_numbers_violate_uniqueness() {
        let store = InMemoryDocumentStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_master_waybill(waybill(12)).await.unwrap();
        assert!(matches!(
            tx.insert_master_waybill(waybill(12)).await,
            Err(StoreError::UniqueViolation { .. })
        ));
    }

    #[tokio::test]
    async fn update_preserves_state_pointer() {
        let store = InMemoryDocumentStore::new();
        let mut tx = store.begin().await.unwrap();
        let id = tx.insert_master_waybill(waybill(1)).await.unwrap();

        let mut row = tx.get_master_waybill(id).await.unwrap().unwrap();
        row.current_state = StateId::new(99);
        row.on_loan = true;
        tx.update_master_waybill(&row).await.unwrap();

        let row = tx.get_master_waybill(id).await.unwrap().unwrap();
        assert!(row.on_loan);
        assert_eq!(row.current_state, StateId::new(1));
    }
}
