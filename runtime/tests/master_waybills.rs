//! Integration tests for master waybill stock.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use chrono::NaiveDate;
use waybill_flow_core::DocumentError;
use waybill_flow_core::event::EventKind;
use waybill_flow_core::workflow::EntityKind;
use waybill_flow_runtime::CreateBatchRequest;
use waybill_flow_testing::fixtures::{PREFIX, admin, batch, coordinator, create_request};
use waybill_flow_testing::{RecordingListener, TestHarness};

fn request(initial: u64, count: usize) -> CreateBatchRequest {
    CreateBatchRequest {
        prefix: PREFIX,
        initial,
        count,
        batch: batch(),
        observations: Some("March stock".into()),
        actor: admin(),
    }
}

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
}

#[tokio::test]
async fn batch_follows_the_check_digit_sequence() {
    let harness = TestHarness::new().await;
    let created = harness
        .flow
        .master_waybills
        .create_batch(request(16, 4))
        .await
        .unwrap();

    let serials: Vec<i64> = created.iter().map(|w| w.sequence).collect();
    assert_eq!(serials, vec![16, 20, 31, 42]);
    assert_eq!(created[1].number(), "145-00000020");
    assert!(created.iter().all(|w| w.current_state.get() == 1));
    assert!(created.iter().all(|w| w.observations.as_deref() == Some("March stock")));

    let preview = harness.flow.master_waybills.preview(16, 4).unwrap();
    assert_eq!(preview, vec![16, 20, 31, 42]);

    let history = harness
        .flow
        .engine
        .history(EntityKind::MasterWaybill, created[0].id.get())
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn overlapping_batch_is_rejected_whole() {
    let harness = TestHarness::new().await;
    harness
        .flow
        .master_waybills
        .create_batch(request(31, 1))
        .await
        .unwrap();

    let err = harness
        .flow
        .master_waybills
        .create_batch(request(16, 3))
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::PreconditionFailed(_)), "{err}");
    assert_eq!(harness.store.snapshot().await.master_waybills.len(), 1);
}

#[tokio::test]
async fn empty_or_zero_batches_are_invalid() {
    let harness = TestHarness::new().await;
    assert!(matches!(
        harness.flow.master_waybills.create_batch(request(16, 0)).await,
        Err(DocumentError::InvalidInput(_))
    ));
    assert!(matches!(
        harness.flow.master_waybills.create_batch(request(0, 2)).await,
        Err(DocumentError::InvalidInput(_))
    ));
    assert!(matches!(
        harness.flow.master_waybills.preview(0, 2),
        Err(DocumentError::Sequence(_))
    ));
    assert!(harness.flow.master_waybills.preview(16, 0).unwrap().is_empty());
}

#[tokio::test]
async fn lent_waybill_cannot_be_coordinated() {
    let harness = TestHarness::new().await;
    let recorder = RecordingListener::new();
    harness
        .flow
        .dispatcher()
        .subscribe(&[EventKind::MasterWaybillLent], recorder.clone());
    let master = harness.master_waybills(1).await.remove(0);

    let lent = harness
        .flow
        .master_waybills
        .lend(master.id, date(2), &admin())
        .await
        .unwrap();
    assert!(lent.on_loan);
    assert_eq!(lent.loaned_on, Some(date(2)));
    assert!(!harness.flow.master_waybills.is_reassignable(master.id).await.unwrap());

    let err = harness
        .flow
        .coordinations
        .create(create_request(master.id, &[3]), &coordinator())
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::PreconditionFailed(_)));

    let err = harness
        .flow
        .master_waybills
        .lend(master.id, date(3), &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::PreconditionFailed(_)));

    harness.settle().await;
    assert_eq!(recorder.kinds(), vec![EventKind::MasterWaybillLent]);
}

#[tokio::test]
async fn assigned_waybill_cannot_be_returned() {
    let harness = TestHarness::new().await;
    let master = harness.master_waybills(1).await.remove(0);
    let record = harness.coordination(master.id, &[3]).await;

    let err = harness
        .flow
        .master_waybills
        .mark_returned(master.id, date(4), &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::PreconditionFailed(_)));

    harness
        .flow
        .coordinations
        .cancel(record.record.id, coordinator(), Some("flight cancelled".into()))
        .await
        .unwrap();
    let returned = harness
        .flow
        .master_waybills
        .mark_returned(master.id, date(5), &admin())
        .await
        .unwrap();
    assert!(returned.returned);
    assert!(!harness.flow.master_waybills.is_reassignable(master.id).await.unwrap());

    let err = harness
        .flow
        .master_waybills
        .mark_returned(master.id, date(6), &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::PreconditionFailed(_)));
}

#[tokio::test]
async fn unknown_waybill_is_not_found() {
    let harness = TestHarness::new().await;
    let err = harness
        .flow
        .master_waybills
        .get(waybill_flow_core::types::MasterWaybillId::new(77))
        .await
        .unwrap_err();
    assert_eq!(err, DocumentError::not_found("master_waybill", 77));
}
