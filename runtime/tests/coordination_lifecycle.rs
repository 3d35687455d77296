//! Integration tests for the coordination record lifecycle.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use std::collections::HashSet;
use tokio::task::JoinSet;
use waybill_flow_core::DocumentError;
use waybill_flow_core::constants::{child_states, coordination_states, master_states};
use waybill_flow_core::event::{DocumentEvent, EventKind};
use waybill_flow_core::providers::{CatalogKind, ProviderError};
use waybill_flow_core::types::{
    ConsigneeId, ConsigneeRequest, CoordinationId, FarmId, MasterWaybillId, PaymentMode, Quantities,
};
use waybill_flow_core::workflow::EntityKind;
use waybill_flow_runtime::{AssignChild, CoordinationPatch, RuntimeConfig};
use waybill_flow_testing::fixtures::{admin, consignees, coordinator, create_request, operator};
use waybill_flow_testing::{InMemoryCatalog, RecordingListener, TestHarness};

fn boxes(full_boxes: f64, pieces: i32) -> Quantities {
    Quantities {
        full_boxes,
        pieces,
        weight_kg: full_boxes * 20.0,
        stems: pieces * 250,
    }
}

async fn assign(harness: &TestHarness, record: CoordinationId, farm: i64, consignee: i64, q: Quantities) -> i64 {
    harness
        .flow
        .children
        .assign(
            AssignChild {
                coordination_id: record,
                farm_id: FarmId::new(farm),
                product_id: None,
                consignee_id: ConsigneeId::new(consignee),
                quantities: Some(q),
            },
            &operator(),
        )
        .await
        .unwrap()
        .child
        .id
        .get()
}

async fn master_state(harness: &TestHarness, id: MasterWaybillId) -> i64 {
    harness
        .flow
        .master_waybills
        .get(id)
        .await
        .unwrap()
        .current_state
        .get()
}

#[tokio::test]
async fn create_assigns_the_master_waybill() {
    let harness = TestHarness::new().await;
    let recorder = RecordingListener::new();
    harness.flow.dispatcher().subscribe(&EventKind::ALL, recorder.clone());
    let master = harness.master_waybills(1).await.remove(0);

    let view = harness.coordination(master.id, &[3, 4]).await;
    assert_eq!(view.record.current_state.get(), 10);
    assert_eq!(view.principal(), Some(ConsigneeId::new(3)));
    assert_eq!(view.consignees.len(), 2);
    assert_eq!(master_state(&harness, master.id).await, 2);
    assert!(!harness.flow.master_waybills.is_reassignable(master.id).await.unwrap());

    harness.settle().await;
    let kinds: HashSet<EventKind> = recorder.kinds().into_iter().collect();
    assert!(kinds.contains(&EventKind::MasterWaybillStateChanged));
    assert!(kinds.contains(&EventKind::CoordinationStateChanged));
}

#[tokio::test]
async fn invalid_consignee_sets_are_rejected_without_writes() {
    let harness = TestHarness::new().await;
    let master = harness.master_waybills(1).await.remove(0);
    let commits = harness.store.commit_count();

    let cases = [
        Vec::new(),
        vec![ConsigneeRequest::additional(ConsigneeId::new(3))],
        vec![
            ConsigneeRequest::principal(ConsigneeId::new(3)),
            ConsigneeRequest::principal(ConsigneeId::new(4)),
        ],
        vec![
            ConsigneeRequest::principal(ConsigneeId::new(3)),
            ConsigneeRequest::additional(ConsigneeId::new(3)),
        ],
    ];
    for set in cases {
        let mut request = create_request(master.id, &[]);
        request.consignees = set;
        let err = harness
            .flow
            .coordinations
            .create(request, &coordinator())
            .await
            .unwrap_err();
        assert!(matches!(err, DocumentError::PreconditionFailed(_)), "{err}");
    }

    assert_eq!(harness.store.commit_count(), commits);
    assert_eq!(master_state(&harness, master.id).await, 1);
}

#[tokio::test]
async fn unknown_catalog_entities_are_not_found() {
    let catalog = InMemoryCatalog::new();
    catalog.insert(CatalogKind::Product, [9]);
    catalog.insert(CatalogKind::Destination, [1, 2]);
    catalog.insert(CatalogKind::Consignee, [3]);
    let harness = TestHarness::build(RuntimeConfig::default(), catalog).await;
    let master = harness.master_waybills(1).await.remove(0);

    let err = harness
        .flow
        .coordinations
        .create(create_request(master.id, &[3, 5]), &coordinator())
        .await
        .unwrap_err();
    assert_eq!(err, DocumentError::not_found("consignee", 5));

    harness.catalog.set_unavailable(true);
    let err = harness
        .flow
        .coordinations
        .create(create_request(master.id, &[3]), &coordinator())
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::Provider(ProviderError::Unavailable(_))));

    harness.catalog.set_unavailable(false);
    harness.coordination(master.id, &[3]).await;
}

#[tokio::test]
async fn a_master_waybill_backs_one_active_record() {
    let harness = TestHarness::new().await;
    let master = harness.master_waybills(1).await.remove(0);
    harness.coordination(master.id, &[3]).await;

    let err = harness
        .flow
        .coordinations
        .create(create_request(master.id, &[4]), &coordinator())
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::PreconditionFailed(_)), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_on_one_waybill_have_one_winner() {
    let harness = TestHarness::new().await;
    let master_id = harness.master_waybills(1).await.remove(0).id;

    let mut tasks = JoinSet::new();
    for consignee in 1..=8 {
        let service = harness.flow.coordinations.clone();
        tasks.spawn(async move {
            service
                .create(create_request(master_id, &[consignee]), &coordinator())
                .await
        });
    }

    let mut won = 0;
    let mut lost = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(_) => won += 1,
            Err(DocumentError::PreconditionFailed(_)) => lost += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((won, lost), (1, 7));
    assert_eq!(harness.store.snapshot().await.coordinations.len(), 1);
}

#[tokio::test]
async fn cancel_releases_the_waybill_for_a_new_record() {
    let harness = TestHarness::new().await;
    let master = harness.master_waybills(1).await.remove(0);
    let first = harness.coordination(master.id, &[3]).await.record.id;

    let cancelled = harness.state(EntityKind::Coordination, coordination_states::CANCELLED);
    let change = harness
        .flow
        .coordinations
        .cancel(first, coordinator(), Some("client withdrew".into()))
        .await
        .unwrap();
    assert_eq!(change.to, cancelled);
    assert_eq!(master_state(&harness, master.id).await, 1);
    assert!(harness.flow.master_waybills.is_reassignable(master.id).await.unwrap());

    let second = harness.coordination(master.id, &[4]).await.record.id;
    assert_ne!(first, second);
    assert_eq!(master_state(&harness, master.id).await, 2);

    let err = harness
        .flow
        .coordinations
        .cancel(first, admin(), Some("again".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::PreconditionFailed(_)));
}

#[tokio::test]
async fn refused_cancel_leaves_the_waybill_assigned() {
    let harness = TestHarness::new().await;
    let master = harness.master_waybills(1).await.remove(0);
    let record = harness.coordination(master.id, &[3]).await.record.id;

    let err = harness
        .flow
        .coordinations
        .cancel(record, coordinator(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::MissingComment { .. }));

    let err = harness
        .flow
        .coordinations
        .cancel(record, operator(), Some("no".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::ForbiddenTransition { .. }));

    assert_eq!(master_state(&harness, master.id).await, 2);
    let view = harness.flow.coordinations.get(record).await.unwrap();
    assert_eq!(view.record.current_state.get(), 10);
}

#[tokio::test]
async fn cut_needs_a_child_waybill_and_reports_the_count() {
    let harness = TestHarness::new().await;
    let recorder = RecordingListener::new();
    harness
        .flow
        .dispatcher()
        .subscribe(&[EventKind::CoordinationCut], recorder.clone());
    let master = harness.master_waybills(1).await.remove(0);
    let record = harness.coordination(master.id, &[3, 4]).await.record.id;

    let err = harness
        .flow
        .coordinations
        .cut(record, coordinator(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::PreconditionFailed(_)), "{err}");

    assign(&harness, record, 7, 3, boxes(2.0, 4)).await;
    assign(&harness, record, 8, 4, boxes(1.5, 3)).await;
    let dropped = assign(&harness, record, 9, 4, boxes(1.0, 2)).await;
    let child_cancelled = harness.state(EntityKind::ChildWaybill, child_states::CANCELLED);
    harness
        .flow
        .children
        .transition(dropped.into(), child_cancelled, coordinator(), Some("farm short".into()))
        .await
        .unwrap();

    let change = harness
        .flow
        .coordinations
        .cut(record, coordinator(), None)
        .await
        .unwrap();
    assert_eq!(change.to.get(), 12);
    harness.settle().await;

    let events = recorder.events();
    assert_eq!(events.len(), 1);
    match &events[0].event {
        DocumentEvent::CoordinationCut {
            coordination_id,
            child_count,
            principal_consignee_id,
            ..
        } => {
            assert_eq!(*coordination_id, record);
            assert_eq!(*child_count, 2);
            assert_eq!(*principal_consignee_id, ConsigneeId::new(3));
        },
        other => panic!("unexpected event {other:?}"),
    }

    // A cut record is frozen.
    let err = harness
        .flow
        .coordinations
        .update(record, CoordinationPatch::default(), &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::PreconditionFailed(_)));
    let err = harness
        .flow
        .coordinations
        .cancel(record, admin(), Some("too late".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::PreconditionFailed(_)));
    assert_eq!(
        master_state(&harness, master.id).await,
        harness.state(EntityKind::MasterWaybill, master_states::ASSIGNED).get()
    );
}

#[tokio::test]
async fn box_summary_skips_cancelled_children() {
    let harness = TestHarness::new().await;
    let master = harness.master_waybills(1).await.remove(0);
    let record = harness.coordination(master.id, &[3]).await.record.id;

    assign(&harness, record, 7, 3, boxes(2.0, 4)).await;
    assign(&harness, record, 8, 3, boxes(0.5, 1)).await;
    let dropped = assign(&harness, record, 9, 3, boxes(10.0, 20)).await;
    let child_cancelled = harness.state(EntityKind::ChildWaybill, child_states::CANCELLED);
    harness
        .flow
        .children
        .transition(dropped.into(), child_cancelled, admin(), Some("duplicate".into()))
        .await
        .unwrap();

    let summary = harness.flow.coordinations.box_summary(record).await.unwrap();
    assert_eq!(summary.child_count, 2);
    assert!((summary.full_boxes - 2.5).abs() < f64::EPSILON);
    assert_eq!(summary.pieces, 5);
    assert_eq!(summary.stems, 1250);
}

#[tokio::test]
async fn update_patches_fields_and_consignees() {
    let harness = TestHarness::new().await;
    let master = harness.master_waybills(1).await.remove(0);
    let record = harness.coordination(master.id, &[3]).await.record.id;

    let view = harness
        .flow
        .coordinations
        .update(
            record,
            CoordinationPatch {
                payment_mode: Some(PaymentMode::Collect),
                observations: Some(Some("keep cold".into())),
                consignees: Some(consignees(&[4, 3])),
                ..CoordinationPatch::default()
            },
            &coordinator(),
        )
        .await
        .unwrap();
    assert_eq!(view.record.payment_mode, PaymentMode::Collect);
    assert_eq!(view.record.observations.as_deref(), Some("keep cold"));
    assert_eq!(view.principal(), Some(ConsigneeId::new(4)));

    let err = harness
        .flow
        .coordinations
        .update(
            record,
            CoordinationPatch {
                consignees: Some(Vec::new()),
                ..CoordinationPatch::default()
            },
            &coordinator(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::PreconditionFailed(_)));
}

#[tokio::test]
async fn replacing_consignees_keeps_those_with_live_children() {
    let harness = TestHarness::new().await;
    let master = harness.master_waybills(1).await.remove(0);
    let record = harness.coordination(master.id, &[3, 4]).await.record.id;
    let child = assign(&harness, record, 7, 4, boxes(1.0, 2)).await;

    let err = harness
        .flow
        .coordinations
        .update(
            record,
            CoordinationPatch {
                consignees: Some(consignees(&[3])),
                ..CoordinationPatch::default()
            },
            &coordinator(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::PreconditionFailed(_)), "{err}");
    let view = harness.flow.coordinations.get(record).await.unwrap();
    assert_eq!(view.consignees.len(), 2);

    let child_cancelled = harness.state(EntityKind::ChildWaybill, child_states::CANCELLED);
    harness
        .flow
        .children
        .transition(child.into(), child_cancelled, admin(), Some("farm withdrew".into()))
        .await
        .unwrap();
    let view = harness
        .flow
        .coordinations
        .update(
            record,
            CoordinationPatch {
                consignees: Some(consignees(&[3])),
                ..CoordinationPatch::default()
            },
            &coordinator(),
        )
        .await
        .unwrap();
    assert_eq!(view.consignees.len(), 1);
    assert_eq!(view.principal(), Some(ConsigneeId::new(3)));
}

#[tokio::test]
async fn available_actions_follow_roles_and_state() {
    let harness = TestHarness::new().await;
    let master = harness.master_waybills(1).await.remove(0);
    let record = harness.coordination(master.id, &[3]).await.record.id;

    let targets = |actions: Vec<waybill_flow_core::workflow::TransitionDefinition>| {
        actions.iter().map(|t| t.to.get()).collect::<Vec<_>>()
    };
    let coordinator_roles = coordinator().roles.unwrap();
    let operator_roles = operator().roles.unwrap();

    let actions = harness
        .flow
        .coordinations
        .available_actions(record, Some(&coordinator_roles))
        .await
        .unwrap();
    assert_eq!(targets(actions), vec![11, 12, 13]);

    let actions = harness
        .flow
        .coordinations
        .available_actions(record, Some(&operator_roles))
        .await
        .unwrap();
    assert!(actions.is_empty());

    let err = harness
        .flow
        .coordinations
        .available_actions(CoordinationId::new(999), None)
        .await
        .unwrap_err();
    assert_eq!(err, DocumentError::not_found("coordination", 999));
}
