//! Workflow constants.
//!
//! State names and role identifiers used by the seeded workflow configuration.
//! Services resolve state ids by these names when they are constructed, so a
//! deployment can renumber states freely as long as the names stay stable.

/// Actor id recorded for system-attributed transitions.
pub const SYSTEM_ACTOR: &str = "system";

/// Master waybill state names.
pub mod master_states {
    /// Blank stock that can be bound to a coordination record.
    pub const AVAILABLE: &str = "available";
    /// Bound to an active coordination record.
    pub const ASSIGNED: &str = "assigned";
    /// Voided stock; terminal.
    pub const VOIDED: &str = "voided";
}

/// Coordination record state names.
pub mod coordination_states {
    /// Freshly created.
    pub const CREATED: &str = "created";
    /// Every child waybill confirmed.
    pub const COORDINATED: &str = "coordinated";
    /// Finalized (corte); terminal.
    pub const CUT: &str = "cut";
    /// Cancelled; terminal.
    pub const CANCELLED: &str = "cancelled";
}

/// Child waybill state names.
pub mod child_states {
    /// Allocated but not yet confirmed by the farm.
    pub const REGISTERED: &str = "registered";
    /// Confirmed by the farm.
    pub const CONFIRMED: &str = "confirmed";
    /// Cancelled; terminal.
    pub const CANCELLED: &str = "cancelled";
}

/// Role identifiers used by the seeded transition table.
pub mod roles {
    /// Full access.
    pub const ADMIN: &str = "admin";
    /// Agency coordinator.
    pub const COORDINATOR: &str = "coordinator";
    /// Warehouse/farm operator.
    pub const OPERATOR: &str = "operator";
}

/// Defaults for runtime configuration.
pub mod defaults {
    /// Loyalty points granted per child waybill on cut.
    pub const LOYALTY_POINTS_PER_CHILD: i64 = 10;
    /// Days until accrued loyalty points expire.
    pub const LOYALTY_EXPIRY_DAYS: i64 = 365;
    /// Capacity of each listener queue.
    pub const EVENT_QUEUE_CAPACITY: usize = 1024;
    /// Attempts made when an allocation races on the dedup key.
    pub const ALLOCATION_RETRIES: usize = 3;
}
