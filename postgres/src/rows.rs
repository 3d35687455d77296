//! Row shapes returned by queries and their conversion to domain types.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::FromRow;
use waybill_flow_core::StoreError;
use waybill_flow_core::types::{
    ActorId, AgencyId, CarrierId, Charges, ChildWaybill, ChildWaybillId, ConsigneeAssignment,
    ConsigneeId, CoordinationId, CoordinationRecord, DestinationId, FarmId, HistoryId,
    MasterWaybill, MasterWaybillId, NumberFormatKind, PaymentMode, ProductId, Quantities, Role,
    WaybillBatch,
};
use waybill_flow_core::workflow::{
    EntityKind, StateDefinition, StateHistoryEntry, StateId, TransitionDefinition,
};

/// Column list of `master_waybills`, in [`MasterWaybillRow`] order.
macro_rules! master_columns {
    () => {
        "id, prefix, sequence, issued_on, carrier_id, agency_id, stock_tag, current_state_id, \
         on_loan, loaned_on, returned, returned_on, observations, created_at, updated_at"
    };
}

/// Column list of `coordinations`, in [`CoordinationRow`] order.
macro_rules! coordination_columns {
    () => {
        "id, master_waybill_id, product_id, origin_destination_id, final_destination_id, \
         payment_mode, flight_date, rate_cents, fuel_cents, security_cents, handling_cents, \
         other_charges_cents, observations, current_state_id, created_at, updated_at"
    };
}

/// Column list of `child_waybills`, in [`ChildWaybillRow`] order.
macro_rules! child_columns {
    () => {
        "id, coordination_id, master_waybill_id, farm_id, product_id, consignee_id, full_boxes, \
         pieces, weight_kg, stems, number, number_format, year, sequence, dedup_key, \
         current_state_id, created_at, updated_at"
    };
}

pub(crate) use child_columns;
pub(crate) use coordination_columns;
pub(crate) use master_columns;

fn entity_kind(value: &str) -> Result<EntityKind, StoreError> {
    EntityKind::parse(value).ok_or_else(|| StoreError::Decode(format!("unknown entity kind '{value}'")))
}

fn sequence(value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Decode(format!("sequence {value} out of range")))
}

#[derive(FromRow)]
pub(crate) struct MasterWaybillRow {
    id: i64,
    prefix: i32,
    sequence: i64,
    issued_on: NaiveDate,
    carrier_id: i64,
    agency_id: Option<i64>,
    stock_tag: Option<String>,
    current_state_id: i64,
    on_loan: bool,
    loaned_on: Option<NaiveDate>,
    returned: bool,
    returned_on: Option<NaiveDate>,
    observations: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<MasterWaybillRow> for MasterWaybill {
    fn from(row: MasterWaybillRow) -> Self {
        Self {
            id: MasterWaybillId::new(row.id),
            prefix: row.prefix,
            sequence: row.sequence,
            batch: WaybillBatch {
                issued_on: row.issued_on,
                carrier_id: CarrierId::new(row.carrier_id),
                agency_id: row.agency_id.map(AgencyId::new),
                stock_tag: row.stock_tag,
            },
            current_state: StateId::new(row.current_state_id),
            on_loan: row.on_loan,
            loaned_on: row.loaned_on,
            returned: row.returned,
            returned_on: row.returned_on,
            observations: row.observations,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
pub(crate) struct CoordinationRow {
    id: i64,
    master_waybill_id: i64,
    product_id: i64,
    origin_destination_id: i64,
    final_destination_id: i64,
    payment_mode: String,
    flight_date: NaiveDate,
    rate_cents: i64,
    fuel_cents: i64,
    security_cents: i64,
    handling_cents: i64,
    other_charges_cents: i64,
    observations: Option<String>,
    current_state_id: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CoordinationRow> for CoordinationRecord {
    type Error = StoreError;

    fn try_from(row: CoordinationRow) -> Result<Self, Self::Error> {
        let payment_mode = PaymentMode::parse(&row.payment_mode).ok_or_else(|| {
            StoreError::Decode(format!("unknown payment mode '{}'", row.payment_mode))
        })?;
        Ok(Self {
            id: CoordinationId::new(row.id),
            master_waybill_id: MasterWaybillId::new(row.master_waybill_id),
            product_id: ProductId::new(row.product_id),
            origin_destination_id: DestinationId::new(row.origin_destination_id),
            final_destination_id: DestinationId::new(row.final_destination_id),
            payment_mode,
            flight_date: row.flight_date,
            charges: Charges {
                rate_cents: row.rate_cents,
                fuel_cents: row.fuel_cents,
                security_cents: row.security_cents,
                handling_cents: row.handling_cents,
                other_charges_cents: row.other_charges_cents,
            },
            observations: row.observations,
            current_state: StateId::new(row.current_state_id),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct ConsigneeRow {
    coordination_id: i64,
    consignee_id: i64,
    is_principal: bool,
}

impl From<ConsigneeRow> for ConsigneeAssignment {
    fn from(row: ConsigneeRow) -> Self {
        Self {
            coordination_id: CoordinationId::new(row.coordination_id),
            consignee_id: ConsigneeId::new(row.consignee_id),
            is_principal: row.is_principal,
        }
    }
}

#[derive(FromRow)]
pub(crate) struct ChildWaybillRow {
    id: i64,
    coordination_id: i64,
    master_waybill_id: i64,
    farm_id: i64,
    product_id: i64,
    consignee_id: i64,
    full_boxes: f64,
    pieces: i32,
    weight_kg: f64,
    stems: i32,
    number: String,
    number_format: String,
    year: i32,
    sequence: i64,
    dedup_key: String,
    current_state_id: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ChildWaybillRow> for ChildWaybill {
    type Error = StoreError;

    fn try_from(row: ChildWaybillRow) -> Result<Self, Self::Error> {
        let number_format = NumberFormatKind::parse(&row.number_format).ok_or_else(|| {
            StoreError::Decode(format!("unknown number format '{}'", row.number_format))
        })?;
        Ok(Self {
            id: ChildWaybillId::new(row.id),
            coordination_id: CoordinationId::new(row.coordination_id),
            master_waybill_id: MasterWaybillId::new(row.master_waybill_id),
            farm_id: FarmId::new(row.farm_id),
            product_id: ProductId::new(row.product_id),
            consignee_id: ConsigneeId::new(row.consignee_id),
            quantities: Quantities {
                full_boxes: row.full_boxes,
                pieces: row.pieces,
                weight_kg: row.weight_kg,
                stems: row.stems,
            },
            number: row.number,
            number_format,
            year: row.year,
            sequence: sequence(row.sequence)?,
            dedup_key: row.dedup_key,
            current_state: StateId::new(row.current_state_id),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Numbering columns scanned when looking for the last issued sequence.
#[derive(FromRow)]
pub(crate) struct IssuedNumberRow {
    pub number: String,
    pub year: i32,
    pub sequence: i64,
}

impl IssuedNumberRow {
    pub(crate) fn sequence(&self) -> Result<u32, StoreError> {
        sequence(self.sequence)
    }
}

#[derive(FromRow)]
pub(crate) struct HistoryRow {
    id: i64,
    entity_kind: String,
    entity_id: i64,
    state_id: i64,
    actor_id: String,
    comment: Option<String>,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for StateHistoryEntry {
    type Error = StoreError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: HistoryId::new(row.id),
            entity_kind: entity_kind(&row.entity_kind)?,
            entity_id: row.entity_id,
            state_id: StateId::new(row.state_id),
            actor_id: ActorId::new(row.actor_id),
            comment: row.comment,
            recorded_at: row.recorded_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct StateRow {
    id: i64,
    name: String,
    entity_kind: String,
    is_initial: bool,
    is_final: bool,
    description: Option<String>,
    color: Option<String>,
}

impl TryFrom<StateRow> for StateDefinition {
    type Error = StoreError;

    fn try_from(row: StateRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: StateId::new(row.id),
            name: row.name,
            entity_kind: entity_kind(&row.entity_kind)?,
            is_initial: row.is_initial,
            is_final: row.is_final,
            description: row.description,
            color: row.color,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct TransitionRow {
    entity_kind: String,
    from_state_id: i64,
    to_state_id: i64,
    allowed_roles: Vec<String>,
    requires_comment: bool,
    action: Option<String>,
}

impl TryFrom<TransitionRow> for TransitionDefinition {
    type Error = StoreError;

    fn try_from(row: TransitionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            entity_kind: entity_kind(&row.entity_kind)?,
            from: StateId::new(row.from_state_id),
            to: StateId::new(row.to_state_id),
            allowed_roles: row.allowed_roles.into_iter().map(Role::new).collect(),
            requires_comment: row.requires_comment,
            action: row.action,
        })
    }
}
