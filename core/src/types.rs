//! Domain types for the waybill document pipeline.
//!
//! Identifiers are thin newtypes over the relational store's `BIGINT` keys so a
//! farm id can never be passed where a consignee id is expected. Entities mirror
//! the rows the store persists; none of them carry behaviour beyond small
//! invariant checks.

use crate::workflow::StateId;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Wrap a raw store key.
            #[must_use]
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// The raw store key.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(
    /// Identifier of a master waybill (guía madre).
    MasterWaybillId
);
id_type!(
    /// Identifier of a coordination record (documento de coordinación).
    CoordinationId
);
id_type!(
    /// Identifier of a child waybill (guía hija).
    ChildWaybillId
);
id_type!(
    /// Identifier of a consignee in the catalog.
    ConsigneeId
);
id_type!(
    /// Identifier of a farm in the catalog.
    FarmId
);
id_type!(
    /// Identifier of a product in the catalog.
    ProductId
);
id_type!(
    /// Identifier of an airport/destination in the catalog.
    DestinationId
);
id_type!(
    /// Identifier of an airline in the catalog.
    CarrierId
);
id_type!(
    /// Identifier of the referring agency that supplied a waybill batch.
    AgencyId
);
id_type!(
    /// Identifier of a state history row.
    HistoryId
);

/// Identifier of the user (or system component) performing an action.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    /// Create an actor id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The actor id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A role identifier issued by the identity provider.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(String);

impl Role {
    /// Create a role identifier.
    #[must_use]
    pub fn new(role: impl Into<String>) -> Self {
        Self(role.into())
    }

    /// The role as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Set of roles held by an actor or allowed on a transition.
pub type RoleSet = BTreeSet<Role>;

/// Who is performing an operation.
///
/// `roles == None` marks a system-attributed call: the workflow engine skips
/// the role gate but still requires a configured transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Actor identifier recorded in state history.
    pub id: ActorId,
    /// Roles supplied by the identity provider.
    pub roles: Option<RoleSet>,
}

impl Actor {
    /// A role-gated user actor.
    #[must_use]
    pub fn user<I, R>(id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        Self {
            id: ActorId::new(id),
            roles: Some(roles.into_iter().map(Role::new).collect()),
        }
    }

    /// The internal system actor used for compensations and cascades.
    #[must_use]
    pub fn system() -> Self {
        Self {
            id: ActorId::new(crate::constants::SYSTEM_ACTOR),
            roles: None,
        }
    }

    /// Whether this actor bypasses role gating.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        self.roles.is_none()
    }
}

// ============================================================================
// Master waybill
// ============================================================================

/// Batch reference shared by master waybills issued together.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaybillBatch {
    /// Date the airline issued the stock.
    pub issued_on: NaiveDate,
    /// Airline that owns the stock.
    pub carrier_id: CarrierId,
    /// Agency that referred the stock, if any.
    pub agency_id: Option<AgencyId>,
    /// Free-form stock tag printed on the batch.
    pub stock_tag: Option<String>,
}

/// A pre-numbered physical air waybill.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MasterWaybill {
    /// Store key.
    pub id: MasterWaybillId,
    /// Airline numeric prefix (e.g. 145).
    pub prefix: i32,
    /// Serial number within the prefix.
    pub sequence: i64,
    /// Batch the waybill was issued in.
    pub batch: WaybillBatch,
    /// Current workflow state.
    pub current_state: StateId,
    /// Lent to another agency.
    pub on_loan: bool,
    /// When it was lent.
    pub loaned_on: Option<NaiveDate>,
    /// Returned unused to the airline.
    pub returned: bool,
    /// When it was returned.
    pub returned_on: Option<NaiveDate>,
    /// Free-text observations.
    pub observations: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl MasterWaybill {
    /// Printed waybill number, `PPP-SSSSSSSS`.
    #[must_use]
    pub fn number(&self) -> String {
        format!("{:03}-{:08}", self.prefix, self.sequence)
    }

    /// Neither lent nor returned.
    #[must_use]
    pub const fn is_unencumbered(&self) -> bool {
        !self.on_loan && !self.returned
    }
}

/// Row data for inserting a master waybill.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewMasterWaybill {
    /// Airline numeric prefix.
    pub prefix: i32,
    /// Serial number.
    pub sequence: i64,
    /// Batch reference.
    pub batch: WaybillBatch,
    /// Initial workflow state.
    pub state: StateId,
    /// Free-text observations.
    pub observations: Option<String>,
    /// Insert timestamp.
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Coordination record
// ============================================================================

/// How the freight is paid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMode {
    /// Freight prepaid by the shipper.
    Prepaid,
    /// Freight collected at destination.
    Collect,
}

impl PaymentMode {
    /// Store representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prepaid => "PP",
            Self::Collect => "CC",
        }
    }

    /// Parse the store representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PP" => Some(Self::Prepaid),
            "CC" => Some(Self::Collect),
            _ => None,
        }
    }
}

/// Cost and service charges of a coordination record, in cents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charges {
    /// Freight rate.
    pub rate_cents: i64,
    /// Fuel surcharge.
    pub fuel_cents: i64,
    /// Security surcharge.
    pub security_cents: i64,
    /// Handling fee.
    pub handling_cents: i64,
    /// Anything else billed on the waybill.
    pub other_charges_cents: i64,
}

impl Charges {
    /// Sum of every charge.
    #[must_use]
    pub const fn total_cents(&self) -> i64 {
        self.rate_cents
            + self.fuel_cents
            + self.security_cents
            + self.handling_cents
            + self.other_charges_cents
    }
}

/// Business object binding one master waybill to a shipment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoordinationRecord {
    /// Store key.
    pub id: CoordinationId,
    /// The consumed master waybill.
    pub master_waybill_id: MasterWaybillId,
    /// Product shipped.
    pub product_id: ProductId,
    /// First destination (airport of arrival).
    pub origin_destination_id: DestinationId,
    /// Final destination.
    pub final_destination_id: DestinationId,
    /// Payment mode.
    pub payment_mode: PaymentMode,
    /// Planned flight date.
    pub flight_date: NaiveDate,
    /// Cost/service fields.
    pub charges: Charges,
    /// Free-text observations.
    pub observations: Option<String>,
    /// Current workflow state.
    pub current_state: StateId,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Row data for inserting a coordination record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewCoordination {
    /// Consumed master waybill.
    pub master_waybill_id: MasterWaybillId,
    /// Product shipped.
    pub product_id: ProductId,
    /// First destination.
    pub origin_destination_id: DestinationId,
    /// Final destination.
    pub final_destination_id: DestinationId,
    /// Payment mode.
    pub payment_mode: PaymentMode,
    /// Planned flight date.
    pub flight_date: NaiveDate,
    /// Cost/service fields.
    pub charges: Charges,
    /// Free-text observations.
    pub observations: Option<String>,
    /// Initial workflow state.
    pub state: StateId,
    /// Insert timestamp.
    pub created_at: DateTime<Utc>,
}

/// Join row between a coordination record and a consignee.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsigneeAssignment {
    /// Owning coordination record.
    pub coordination_id: CoordinationId,
    /// Assigned consignee.
    pub consignee_id: ConsigneeId,
    /// Principal consignee flag; exactly one per record.
    pub is_principal: bool,
}

/// A consignee requested for a coordination record, before it is persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsigneeRequest {
    /// Consignee to assign.
    pub consignee_id: ConsigneeId,
    /// Whether it is the principal consignee.
    pub is_principal: bool,
}

impl ConsigneeRequest {
    /// The principal consignee.
    #[must_use]
    pub const fn principal(consignee_id: ConsigneeId) -> Self {
        Self {
            consignee_id,
            is_principal: true,
        }
    }

    /// An additional consignee.
    #[must_use]
    pub const fn additional(consignee_id: ConsigneeId) -> Self {
        Self {
            consignee_id,
            is_principal: false,
        }
    }
}

/// Validates a consignee set: non-empty, exactly one principal, no repeats.
///
/// # Errors
///
/// Returns a human-readable reason when the set violates the invariant.
pub fn validate_consignees(consignees: &[ConsigneeRequest]) -> Result<ConsigneeId, String> {
    if consignees.is_empty() {
        return Err("at least one consignee is required".to_string());
    }

    let mut seen = BTreeSet::new();
    for consignee in consignees {
        if !seen.insert(consignee.consignee_id) {
            return Err(format!(
                "consignee {} is listed more than once",
                consignee.consignee_id
            ));
        }
    }

    let mut principals = consignees.iter().filter(|c| c.is_principal);
    match (principals.next(), principals.next()) {
        (Some(principal), None) => Ok(principal.consignee_id),
        (None, _) => Err("exactly one principal consignee is required, found none".to_string()),
        (Some(_), Some(_)) => {
            Err("exactly one principal consignee is required, found several".to_string())
        },
    }
}

// ============================================================================
// Child waybill
// ============================================================================

/// Quantity fields of a child waybill.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Quantities {
    /// Full-box equivalents (half and quarter boxes count fractionally).
    pub full_boxes: f64,
    /// Physical pieces.
    pub pieces: i32,
    /// Gross weight in kilograms.
    pub weight_kg: f64,
    /// Stem count.
    pub stems: i32,
}

/// Stored format of a child waybill number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NumberFormatKind {
    /// Year followed by a 4-digit sequence.
    YearSequence,
    /// Free prefix followed by a 4-digit sequence.
    PrefixSequence,
    /// Plain 8-digit sequence.
    PlainSequence,
    /// Custom `AAAA`/`NNNN` template.
    Custom,
}

impl NumberFormatKind {
    /// Store representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::YearSequence => "year_sequence",
            Self::PrefixSequence => "prefix_sequence",
            Self::PlainSequence => "plain_sequence",
            Self::Custom => "custom",
        }
    }

    /// Parse the store representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "year_sequence" => Some(Self::YearSequence),
            "prefix_sequence" => Some(Self::PrefixSequence),
            "plain_sequence" => Some(Self::PlainSequence),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// Sub-allocation of a coordination record to one farm/product combination.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChildWaybill {
    /// Store key.
    pub id: ChildWaybillId,
    /// Owning coordination record.
    pub coordination_id: CoordinationId,
    /// Master waybill of the owning record (denormalized).
    pub master_waybill_id: MasterWaybillId,
    /// Shipping farm.
    pub farm_id: FarmId,
    /// Product.
    pub product_id: ProductId,
    /// Receiving consignee.
    pub consignee_id: ConsigneeId,
    /// Quantity fields.
    pub quantities: Quantities,
    /// Generated number.
    pub number: String,
    /// Format the number was generated with.
    pub number_format: NumberFormatKind,
    /// Issuing year.
    pub year: i32,
    /// Sequence within the numbering scope.
    pub sequence: u32,
    /// Materialised composite dedup key.
    pub dedup_key: String,
    /// Current workflow state.
    pub current_state: StateId,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Row data for inserting a child waybill.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewChildWaybill {
    /// Owning coordination record.
    pub coordination_id: CoordinationId,
    /// Master waybill of the owning record.
    pub master_waybill_id: MasterWaybillId,
    /// Shipping farm.
    pub farm_id: FarmId,
    /// Product.
    pub product_id: ProductId,
    /// Receiving consignee.
    pub consignee_id: ConsigneeId,
    /// Quantity fields.
    pub quantities: Quantities,
    /// Generated number.
    pub number: String,
    /// Format the number was generated with.
    pub number_format: NumberFormatKind,
    /// Issuing year.
    pub year: i32,
    /// Sequence within the numbering scope.
    pub sequence: u32,
    /// Materialised composite dedup key.
    pub dedup_key: String,
    /// Initial workflow state.
    pub state: StateId,
    /// Insert timestamp.
    pub created_at: DateTime<Utc>,
}

/// Aggregated quantities across the child waybills of a coordination record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoxSummary {
    /// Number of child waybills counted.
    pub child_count: usize,
    /// Sum of full-box equivalents.
    pub full_boxes: f64,
    /// Sum of pieces.
    pub pieces: i64,
    /// Sum of weight.
    pub weight_kg: f64,
    /// Sum of stems.
    pub stems: i64,
}

impl BoxSummary {
    /// Add one child's quantities.
    pub fn add(&mut self, quantities: &Quantities) {
        self.child_count += 1;
        self.full_boxes += quantities.full_boxes;
        self.pieces += i64::from(quantities.pieces);
        self.weight_kg += quantities.weight_kg;
        self.stems += i64::from(quantities.stems);
    }
}

impl<'a> FromIterator<&'a Quantities> for BoxSummary {
    fn from_iter<T: IntoIterator<Item = &'a Quantities>>(iter: T) -> Self {
        let mut summary = Self::default();
        for quantities in iter {
            summary.add(quantities);
        }
        summary
    }
}
