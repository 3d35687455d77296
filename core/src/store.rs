//! Persistence abstraction.
//!
//! A [`DocumentStore`] hands out transactions. Every composite operation runs
//! inside one [`DocumentTx`]: reads lock the rows they return, writes become
//! visible on [`DocumentTx::commit`], and dropping an uncommitted transaction
//! rolls it back.
//!
//! Entity `update_*` methods write every column except `current_state`; the
//! state pointer only moves through [`DocumentTx::set_current_state`], which
//! the workflow engine pairs with a history entry.

use crate::error::StoreError;
use crate::numbering::NumberingScope;
use crate::types::{
    ChildWaybill, ChildWaybillId, ConsigneeAssignment, ConsigneeRequest, CoordinationId,
    CoordinationRecord, HistoryId, MasterWaybill, MasterWaybillId, NewChildWaybill,
    NewCoordination, NewMasterWaybill,
};
use crate::workflow::{
    EntityKind, NewStateHistory, StateDefinition, StateHistoryEntry, StateId, TransitionDefinition,
};
use chrono::{DateTime, Utc};
use std::future::Future;

/// State and transition rows as loaded from configuration storage.
#[derive(Clone, Debug, Default)]
pub struct WorkflowRows {
    /// Configured states.
    pub states: Vec<StateDefinition>,
    /// Configured transitions.
    pub transitions: Vec<TransitionDefinition>,
}

/// Transactional document storage.
pub trait DocumentStore: Clone + Send + Sync + 'static {
    /// Transaction type.
    type Tx: DocumentTx;

    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if no transaction can be started.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx, StoreError>> + Send;

    /// Load the configured workflow tables.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the tables cannot be read or decoded.
    fn load_workflow(&self) -> impl Future<Output = Result<WorkflowRows, StoreError>> + Send;
}

/// One unit of work against the store.
pub trait DocumentTx: Send + Sized {
    // ------------------------------------------------------------------
    // Workflow pointer and history
    // ------------------------------------------------------------------

    /// Current state of an entity, locking its row. `None` if it does not exist.
    fn current_state(
        &mut self,
        kind: EntityKind,
        entity_id: i64,
    ) -> impl Future<Output = Result<Option<StateId>, StoreError>> + Send;

    /// Move an entity's state pointer and touch its `updated_at`.
    fn set_current_state(
        &mut self,
        kind: EntityKind,
        entity_id: i64,
        state: StateId,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Append an audit row.
    fn append_history(
        &mut self,
        entry: NewStateHistory,
    ) -> impl Future<Output = Result<HistoryId, StoreError>> + Send;

    /// Audit trail of an entity, oldest first.
    fn history(
        &mut self,
        kind: EntityKind,
        entity_id: i64,
    ) -> impl Future<Output = Result<Vec<StateHistoryEntry>, StoreError>> + Send;

    // ------------------------------------------------------------------
    // Master waybills
    // ------------------------------------------------------------------

    /// Load and lock a master waybill.
    fn get_master_waybill(
        &mut self,
        id: MasterWaybillId,
    ) -> impl Future<Output = Result<Option<MasterWaybill>, StoreError>> + Send;

    /// Whether `(prefix, sequence)` is already issued.
    fn master_waybill_exists(
        &mut self,
        prefix: i32,
        sequence: i64,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Insert a master waybill. A duplicate `(prefix, sequence)` is a
    /// [`StoreError::UniqueViolation`].
    fn insert_master_waybill(
        &mut self,
        waybill: NewMasterWaybill,
    ) -> impl Future<Output = Result<MasterWaybillId, StoreError>> + Send;

    /// Write a master waybill's columns.
    fn update_master_waybill(
        &mut self,
        waybill: &MasterWaybill,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    // ------------------------------------------------------------------
    // Coordination records
    // ------------------------------------------------------------------

    /// A coordination record on `master_waybill_id` whose state is not in
    /// `final_states`, if any.
    fn active_coordination_for(
        &mut self,
        master_waybill_id: MasterWaybillId,
        final_states: &[StateId],
    ) -> impl Future<Output = Result<Option<CoordinationId>, StoreError>> + Send;

    /// Insert a coordination record.
    fn insert_coordination(
        &mut self,
        record: NewCoordination,
    ) -> impl Future<Output = Result<CoordinationId, StoreError>> + Send;

    /// Load and lock a coordination record.
    fn get_coordination(
        &mut self,
        id: CoordinationId,
    ) -> impl Future<Output = Result<Option<CoordinationRecord>, StoreError>> + Send;

    /// Write a coordination record's columns.
    fn update_coordination(
        &mut self,
        record: &CoordinationRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Replace the consignee set of a record.
    fn replace_consignees(
        &mut self,
        id: CoordinationId,
        consignees: &[ConsigneeRequest],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Consignees of a record, principal first.
    fn consignees(
        &mut self,
        id: CoordinationId,
    ) -> impl Future<Output = Result<Vec<ConsigneeAssignment>, StoreError>> + Send;

    // ------------------------------------------------------------------
    // Child waybills
    // ------------------------------------------------------------------

    /// The child waybill stored under a dedup key, in any state.
    fn find_child_by_key(
        &mut self,
        dedup_key: &str,
    ) -> impl Future<Output = Result<Option<ChildWaybill>, StoreError>> + Send;

    /// Insert a child waybill. A taken dedup key is a
    /// [`StoreError::UniqueViolation`].
    fn insert_child(
        &mut self,
        child: NewChildWaybill,
    ) -> impl Future<Output = Result<ChildWaybillId, StoreError>> + Send;

    /// Write a child waybill's columns.
    fn update_child(
        &mut self,
        child: &ChildWaybill,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Load and lock a child waybill.
    fn get_child(
        &mut self,
        id: ChildWaybillId,
    ) -> impl Future<Output = Result<Option<ChildWaybill>, StoreError>> + Send;

    /// Child waybills of a record, by id.
    fn children_of(
        &mut self,
        coordination_id: CoordinationId,
    ) -> impl Future<Output = Result<Vec<ChildWaybill>, StoreError>> + Send;

    /// Highest sequence issued in a numbering scope.
    fn last_issued_sequence(
        &mut self,
        scope: &NumberingScope,
    ) -> impl Future<Output = Result<Option<u32>, StoreError>> + Send;

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Make every write of this transaction visible.
    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}
