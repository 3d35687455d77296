//! Integration tests for child waybill allocation and numbering.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use chrono::{TimeZone, Utc};
use waybill_flow_core::DocumentError;
use waybill_flow_core::allocation::DedupRule;
use waybill_flow_core::constants::child_states;
use waybill_flow_core::event::{DocumentEvent, EventKind};
use waybill_flow_core::numbering::NumberFormat;
use waybill_flow_core::providers::CatalogKind;
use waybill_flow_core::types::{
    ConsigneeId, CoordinationId, FarmId, NumberFormatKind, ProductId, Quantities,
};
use waybill_flow_core::workflow::EntityKind;
use waybill_flow_runtime::{Allocation, AllocationOutcome, AssignChild, RuntimeConfig};
use waybill_flow_testing::fixtures::{admin, coordinator, operator};
use waybill_flow_testing::{InMemoryCatalog, RecordingListener, TestHarness};

fn request(record: CoordinationId, farm: i64, consignee: i64) -> AssignChild {
    AssignChild {
        coordination_id: record,
        farm_id: FarmId::new(farm),
        product_id: None,
        consignee_id: ConsigneeId::new(consignee),
        quantities: Some(Quantities {
            full_boxes: 1.0,
            pieces: 2,
            weight_kg: 18.5,
            stems: 500,
        }),
    }
}

async fn assign(harness: &TestHarness, request: AssignChild) -> Allocation {
    harness
        .flow
        .children
        .assign(request, &operator())
        .await
        .unwrap()
}

async fn open_record(harness: &TestHarness, consignees: &[i64]) -> CoordinationId {
    let master = harness.master_waybills(1).await.remove(0);
    harness.coordination(master.id, consignees).await.record.id
}

#[tokio::test]
async fn numbers_run_per_year() {
    let harness = TestHarness::new().await;
    let record = open_record(&harness, &[3]).await;

    let mut numbers = Vec::new();
    for farm in [7, 8, 9] {
        let allocation = assign(&harness, request(record, farm, 3)).await;
        assert_eq!(allocation.outcome, AllocationOutcome::Created);
        assert_eq!(allocation.child.number_format, NumberFormatKind::YearSequence);
        numbers.push(allocation.child.number);
    }
    assert_eq!(numbers, vec!["20260001", "20260002", "20260003"]);

    harness
        .clock
        .set(Utc.with_ymd_and_hms(2027, 1, 2, 8, 0, 0).unwrap());
    let allocation = assign(&harness, request(record, 10, 3)).await;
    assert_eq!(allocation.child.number, "20270001");
    assert_eq!(allocation.child.year, 2027);
}

#[tokio::test]
async fn configured_prefix_format_is_used() {
    let config = RuntimeConfig {
        number_format: NumberFormat::prefix("GH").unwrap(),
        ..RuntimeConfig::default()
    };
    let harness = TestHarness::with_config(config).await;
    let record = open_record(&harness, &[3]).await;

    let first = assign(&harness, request(record, 7, 3)).await;
    let second = assign(&harness, request(record, 8, 3)).await;
    assert_eq!(first.child.number, "GH0001");
    assert_eq!(second.child.number, "GH0002");
    assert_eq!(second.child.number_format, NumberFormatKind::PrefixSequence);
}

#[tokio::test]
async fn same_key_reuses_the_child() {
    let harness = TestHarness::new().await;
    let record = open_record(&harness, &[3]).await;

    let first = assign(&harness, request(record, 7, 3)).await;
    let mut again = request(record, 7, 3);
    again.quantities = None;
    let second = assign(&harness, again).await;
    assert_eq!(second.outcome, AllocationOutcome::Reused);
    assert!(second.reused());
    assert_eq!(second.child.id, first.child.id);
    assert_eq!(second.child.number, first.child.number);
    assert_eq!(second.child.quantities, first.child.quantities);

    let mut resized = request(record, 7, 3);
    resized.quantities = Some(Quantities {
        full_boxes: 4.0,
        ..Quantities::default()
    });
    let third = assign(&harness, resized).await;
    assert_eq!(third.child.id, first.child.id);
    assert!((third.child.quantities.full_boxes - 4.0).abs() < f64::EPSILON);

    let children = harness
        .flow
        .children
        .list_for_coordination(record)
        .await
        .unwrap();
    assert_eq!(children.len(), 1);
}

#[tokio::test]
async fn cancelled_record_children_are_repointed() {
    let harness = TestHarness::new().await;
    let master = harness.master_waybills(1).await.remove(0);
    let first = harness.coordination(master.id, &[3]).await.record.id;
    let original = assign(&harness, request(first, 7, 3)).await.child;

    harness
        .flow
        .coordinations
        .cancel(first, coordinator(), Some("rebooked".into()))
        .await
        .unwrap();
    let second = harness.coordination(master.id, &[3]).await.record.id;

    let moved = assign(&harness, request(second, 7, 3)).await;
    assert_eq!(moved.outcome, AllocationOutcome::Repointed);
    assert_eq!(moved.child.id, original.id);
    assert_eq!(moved.child.number, original.number);
    assert_eq!(moved.child.coordination_id, second);
    assert_eq!(moved.child.dedup_key, original.dedup_key);

    assert!(
        harness
            .flow
            .children
            .list_for_coordination(first)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn farm_rule_follows_the_farm_across_waybills() {
    let config = RuntimeConfig {
        dedup_rule: DedupRule::Farm,
        ..RuntimeConfig::default()
    };
    let harness = TestHarness::with_config(config).await;
    let masters = harness.master_waybills(2).await;
    let first = harness.coordination(masters[0].id, &[3]).await.record.id;
    let second = harness.coordination(masters[1].id, &[4]).await.record.id;

    let original = assign(&harness, request(first, 7, 3)).await.child;
    assert_eq!(original.dedup_key, "farm:f7");

    let moved = assign(&harness, request(second, 7, 4)).await;
    assert_eq!(moved.outcome, AllocationOutcome::Repointed);
    assert_eq!(moved.child.id, original.id);
    assert_eq!(moved.child.master_waybill_id, masters[1].id);
    assert_eq!(moved.child.consignee_id, ConsigneeId::new(4));
}

#[tokio::test]
async fn cancelled_child_is_not_handed_out_again() {
    let harness = TestHarness::new().await;
    let record = open_record(&harness, &[3]).await;
    let child = assign(&harness, request(record, 7, 3)).await.child;
    let cancelled = harness.state(EntityKind::ChildWaybill, child_states::CANCELLED);
    harness
        .flow
        .children
        .transition(child.id, cancelled, admin(), Some("farm withdrew".into()))
        .await
        .unwrap();

    let err = harness
        .flow
        .children
        .assign(request(record, 7, 3), &operator())
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::PreconditionFailed(_)), "{err}");
    assert!(!err.is_retryable());

    let stored = harness.flow.children.get(child.id).await.unwrap();
    assert_eq!(stored.current_state, cancelled);
    let children = harness.store.snapshot().await.children;
    assert_eq!(children.len(), 1);
}

#[tokio::test]
async fn children_of_a_cut_record_stay_put() {
    let config = RuntimeConfig {
        dedup_rule: DedupRule::Farm,
        ..RuntimeConfig::default()
    };
    let harness = TestHarness::with_config(config).await;
    let masters = harness.master_waybills(2).await;
    let first = harness.coordination(masters[0].id, &[3]).await.record.id;
    let second = harness.coordination(masters[1].id, &[3]).await.record.id;

    let original = assign(&harness, request(first, 7, 3)).await.child;
    harness
        .flow
        .coordinations
        .cut(first, coordinator(), None)
        .await
        .unwrap();
    let before = harness.flow.coordinations.box_summary(first).await.unwrap();

    let err = harness
        .flow
        .children
        .assign(request(second, 7, 3), &operator())
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::PreconditionFailed(_)), "{err}");

    let stored = harness.flow.children.get(original.id).await.unwrap();
    assert_eq!(stored.coordination_id, first);
    let after = harness.flow.coordinations.box_summary(first).await.unwrap();
    assert_eq!(after, before);
    assert_eq!(after.child_count, 1);
}

#[tokio::test]
async fn default_rule_keeps_products_apart() {
    let harness = TestHarness::new().await;
    let record = open_record(&harness, &[3]).await;

    let roses = assign(&harness, request(record, 7, 3)).await.child;
    let mut carnations = request(record, 7, 3);
    carnations.product_id = Some(ProductId::new(11));
    let carnations = assign(&harness, carnations).await.child;

    assert_ne!(roses.id, carnations.id);
    assert_eq!(carnations.product_id, ProductId::new(11));
}

#[tokio::test]
async fn lost_race_is_retried_onto_the_winner() {
    let harness = TestHarness::new().await;
    let recorder = RecordingListener::new();
    harness
        .flow
        .dispatcher()
        .subscribe(&[EventKind::ChildWaybillAssigned], recorder.clone());
    let record = open_record(&harness, &[3]).await;

    harness.store.preempt_child_inserts(1);
    let allocation = assign(&harness, request(record, 7, 3)).await;
    assert_eq!(allocation.outcome, AllocationOutcome::Reused);

    let children = harness.store.snapshot().await.children;
    assert_eq!(children.len(), 1);

    harness.settle().await;
    match &recorder.events()[..] {
        [envelope] => match &envelope.event {
            DocumentEvent::ChildWaybillAssigned { reused, .. } => assert!(*reused),
            other => panic!("unexpected event {other:?}"),
        },
        other => panic!("expected one event, got {}", other.len()),
    }
}

#[tokio::test]
async fn race_beyond_the_retry_budget_surfaces() {
    let config = RuntimeConfig {
        allocation_retries: 0,
        ..RuntimeConfig::default()
    };
    let harness = TestHarness::with_config(config).await;
    let record = open_record(&harness, &[3]).await;

    harness.store.preempt_child_inserts(1);
    let err = harness
        .flow
        .children
        .assign(request(record, 7, 3), &operator())
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::DuplicateAllocation { .. }), "{err}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn assignment_preconditions() {
    let catalog = InMemoryCatalog::allow_all();
    let harness = TestHarness::build(RuntimeConfig::default(), catalog).await;
    let record = open_record(&harness, &[3, 4]).await;

    let err = harness
        .flow
        .children
        .assign(request(record, 7, 5), &operator())
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::PreconditionFailed(_)), "{err}");

    let err = harness
        .flow
        .children
        .assign(request(CoordinationId::new(999), 7, 3), &operator())
        .await
        .unwrap_err();
    assert_eq!(err, DocumentError::not_found("coordination", 999));

    assign(&harness, request(record, 7, 4)).await;
    harness
        .flow
        .coordinations
        .cut(record, coordinator(), None)
        .await
        .unwrap();
    let err = harness
        .flow
        .children
        .assign(request(record, 8, 3), &operator())
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::PreconditionFailed(_)), "{err}");
}

#[tokio::test]
async fn unknown_farm_is_not_found() {
    let catalog = InMemoryCatalog::new();
    catalog.insert(CatalogKind::Product, [9]);
    catalog.insert(CatalogKind::Destination, [1, 2]);
    catalog.insert(CatalogKind::Consignee, [3]);
    catalog.insert(CatalogKind::Farm, [7]);
    let harness = TestHarness::build(RuntimeConfig::default(), catalog).await;
    let record = open_record(&harness, &[3]).await;

    let err = harness
        .flow
        .children
        .assign(request(record, 8, 3), &operator())
        .await
        .unwrap_err();
    assert_eq!(err, DocumentError::not_found("farm", 8));
    assign(&harness, request(record, 7, 3)).await;
}

#[tokio::test]
async fn child_transitions_are_role_gated() {
    let harness = TestHarness::new().await;
    let record = open_record(&harness, &[3]).await;
    let child = assign(&harness, request(record, 7, 3)).await.child;
    let registered = harness.state(EntityKind::ChildWaybill, child_states::REGISTERED);
    let confirmed = harness.state(EntityKind::ChildWaybill, child_states::CONFIRMED);
    assert_eq!(child.current_state, registered);

    harness
        .flow
        .children
        .transition(child.id, confirmed, operator(), None)
        .await
        .unwrap();

    let err = harness
        .flow
        .children
        .transition(child.id, registered, operator(), Some("farm recount".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::ForbiddenTransition { .. }));

    let err = harness
        .flow
        .children
        .transition(child.id, registered, admin(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::MissingComment { .. }));

    harness
        .flow
        .children
        .transition(child.id, registered, admin(), Some("farm recount".into()))
        .await
        .unwrap();
    let history = harness
        .flow
        .engine
        .history(EntityKind::ChildWaybill, child.id.get())
        .await
        .unwrap();
    assert_eq!(history.len(), 3);
    harness.settle().await;
}
