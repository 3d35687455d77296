//! Metric names and descriptions.
//!
//! Counters are emitted through the [`metrics`] facade; installing a
//! recorder (Prometheus or otherwise) is left to the host process. Call
//! [`describe`] once after installing it.

use metrics::describe_counter;

/// Transitions applied, labelled by `kind`.
pub const TRANSITIONS_EXECUTED: &str = "waybill.transitions.executed";
/// Transitions rejected before any write, labelled by `kind`.
pub const TRANSITIONS_REJECTED: &str = "waybill.transitions.rejected";
/// Child waybill allocations, labelled by `outcome`.
pub const ALLOCATIONS: &str = "waybill.allocations";
/// Events accepted by the dispatcher, labelled by `event`.
pub const EVENTS_DISPATCHED: &str = "waybill.events.dispatched";
/// Deliveries dropped on a full or closed queue, labelled by `listener`.
pub const EVENTS_DROPPED: &str = "waybill.events.dropped";
/// Listener invocations that returned an error, labelled by `listener`.
pub const LISTENER_FAILURES: &str = "waybill.listener.failures";

/// Register descriptions for every metric this crate emits.
pub fn describe() {
    describe_counter!(
        TRANSITIONS_EXECUTED,
        "Total number of workflow transitions applied"
    );
    describe_counter!(
        TRANSITIONS_REJECTED,
        "Total number of transitions rejected as forbidden or missing a comment"
    );
    describe_counter!(
        ALLOCATIONS,
        "Total number of child waybill allocations by outcome"
    );
    describe_counter!(EVENTS_DISPATCHED, "Total number of events dispatched");
    describe_counter!(
        EVENTS_DROPPED,
        "Total number of listener deliveries dropped on a full queue"
    );
    describe_counter!(
        LISTENER_FAILURES,
        "Total number of listener invocations that failed"
    );
}
