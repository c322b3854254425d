use std::sync::Arc;

use epcis_common::dispatch::{fields, DispatchRecord, DispatchStatus};
use epcis_common::store::MemoryStore;
use epcis_dispatcher::cycle::{Collections, CycleSummary, DispatchPipeline};
use epcis_dispatcher::document::StoredDocumentSource;
use epcis_dispatcher::error::DispatchError;
use epcis_dispatcher::selector::DispatchSettings;
use epcis_dispatcher::test_utils::{
    insert_approved_operation, FakeStatusChannel, FakeSubmissionChannel, ScriptedResponse,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const SHIPPING: &str = "shipping_scanning_operation";
const LEDGER: &str = "EPCIS_outbound";

fn collections() -> Collections {
    Collections {
        shipping: SHIPPING.to_owned(),
        dispatch: LEDGER.to_owned(),
    }
}

fn settings(batch_size: usize) -> DispatchSettings {
    DispatchSettings {
        batch_size,
        ..Default::default()
    }
}

fn ledger_entry(store: &MemoryStore, shipping_operation_id: &str) -> DispatchRecord {
    let row = store
        .records(LEDGER)
        .into_iter()
        .find(|row| row[fields::SHIPPING_OPERATION_ID] == json!(shipping_operation_id))
        .expect("ledger entry exists");
    DispatchRecord::from_fields(&row).expect("ledger entry decodes")
}

fn build_pipeline(
    store: &Arc<MemoryStore>,
    submission: Arc<FakeSubmissionChannel>,
    status: Arc<FakeStatusChannel>,
    batch_size: usize,
) -> DispatchPipeline {
    DispatchPipeline::new(
        store.clone(),
        &collections(),
        Arc::new(StoredDocumentSource::new(store.clone(), None)),
        submission,
        status,
        settings(batch_size),
    )
}

#[tokio::test]
async fn test_full_cycle_dispatches_and_confirms() {
    let store = Arc::new(MemoryStore::new());
    for id in 1..=3 {
        insert_approved_operation(&store, SHIPPING, id);
    }
    let submission = Arc::new(FakeSubmissionChannel::new(vec![
        ScriptedResponse::Accept("tx-a".to_owned()),
        ScriptedResponse::Accept("tx-b".to_owned()),
        ScriptedResponse::Unavailable(503),
    ]));
    let status = Arc::new(
        FakeStatusChannel::new()
            .with_status("tx-a", Some(4), "Delivered")
            .with_status("tx-b", Some(1), "Queued")
            .with_status("tx-4", Some(1), "Queued"),
    );

    let summary = build_pipeline(&store, submission.clone(), status.clone(), 1)
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    // Batch size one: a single operation goes out per cycle.
    assert_eq!(summary.selected, 1);
    assert_eq!(summary.acknowledged, 1);
    assert_eq!(summary.confirmed, 1);

    let pipeline = build_pipeline(&store, submission.clone(), status.clone(), 10);
    let summary = pipeline
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        summary,
        CycleSummary {
            selected: 2,
            prepared: 2,
            acknowledged: 1,
            retrying: 1,
            failed: 0,
            confirmed: 0,
            rejected_by_partner: 0,
            awaiting_confirmation: 1,
            alerts: 0,
        }
    );

    let first = ledger_entry(&store, "1");
    assert_eq!(first.attempt_count, 1);
    assert_eq!(first.transaction_id().map(|tx| tx.as_str()), Some("tx-a"));
    assert!(first.confirmed_at.is_some());
    assert_eq!(first.target_location.as_deref(), Some("0300011111116"));

    let third = ledger_entry(&store, "3");
    assert_eq!(third.status, DispatchStatus::Retrying);
    assert_eq!(third.attempt_count, 1);

    // Next cycle: the retry goes through, and the pending confirmation is asked again
    // without sending anything twice.
    let summary = pipeline
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.selected, 1);
    assert_eq!(summary.acknowledged, 1);
    assert_eq!(submission.submitted().len(), 4);

    let third = ledger_entry(&store, "3");
    assert_eq!(third.attempt_count, 2);
    assert!(matches!(third.status, DispatchStatus::Acknowledged { .. }));

    let queried = status.queried();
    assert_eq!(queried.iter().filter(|tx| *tx == "tx-a").count(), 1);
    assert_eq!(queried.iter().filter(|tx| *tx == "tx-b").count(), 2);
}

#[tokio::test]
async fn test_rejections_stop_at_the_ledger() {
    let store = Arc::new(MemoryStore::new());
    insert_approved_operation(&store, SHIPPING, 1);
    insert_approved_operation(&store, SHIPPING, 2);
    let submission = Arc::new(FakeSubmissionChannel::new(vec![
        ScriptedResponse::Reject(400),
        ScriptedResponse::Accept("tx".to_owned()),
    ]));
    let status = Arc::new(
        FakeStatusChannel::new()
            .with_status("tx", Some(1), "Queued")
            .with_status("tx-3", Some(1), "Queued"),
    );
    let pipeline = build_pipeline(&store, submission.clone(), status, 10);

    let summary = pipeline
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.alerts, 1);

    // A rejected record below the attempt ceiling is offered again; the acknowledged
    // one never is.
    let summary = pipeline
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.selected, 1);
    assert_eq!(ledger_entry(&store, "1").attempt_count, 2);
    assert_eq!(submission.submitted().len(), 3);
}

#[tokio::test]
async fn test_cancelled_cycle_leaves_ledger_resumable() {
    let store = Arc::new(MemoryStore::new());
    insert_approved_operation(&store, SHIPPING, 1);
    let submission = Arc::new(FakeSubmissionChannel::new(vec![ScriptedResponse::Hang]));
    let status = Arc::new(FakeStatusChannel::new().with_status("tx-2", Some(4), "Complete"));
    let pipeline = build_pipeline(&store, submission, status, 10);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = pipeline.run_cycle(&cancel).await;
    assert!(matches!(result, Err(DispatchError::Cancelled)));

    let entry = ledger_entry(&store, "1");
    assert_eq!(entry.status, DispatchStatus::Processing);
    assert_eq!(entry.attempt_count, 1);
    assert!(entry.last_error.is_none());

    // The interrupted attempt is resumed by the next cycle.
    let summary = pipeline
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.acknowledged, 1);
    assert_eq!(ledger_entry(&store, "1").attempt_count, 2);
}

#[tokio::test]
async fn test_operations_without_documents_exhaust_their_attempts() {
    let store = Arc::new(MemoryStore::new());
    for id in 1..=6 {
        store.insert(
            SHIPPING,
            json!({"id": id, "capture_id": format!("capture-{id}"), "status": "approved"}),
        );
    }
    for id in 7..=10 {
        insert_approved_operation(&store, SHIPPING, id);
    }
    let submission = Arc::new(FakeSubmissionChannel::new(Vec::new()));
    let status = Arc::new(FakeStatusChannel::new());
    let pipeline = build_pipeline(&store, submission.clone(), status, 10);

    // Most of the batch cannot be prepared, so each cycle aborts before sending.
    for attempt in 1..=3 {
        let result = pipeline.run_cycle(&CancellationToken::new()).await;
        assert!(matches!(result, Err(DispatchError::BatchThreshold(_))));

        let entry = ledger_entry(&store, "1");
        assert_eq!(entry.status, DispatchStatus::Failed);
        assert_eq!(entry.attempt_count, attempt);
        assert_eq!(
            entry.last_error.as_deref(),
            Some("shipping operation 1 has no prepared document")
        );
    }
    assert!(submission.submitted().is_empty());

    // With their attempts used up they are no longer offered and the rest goes out.
    let summary = pipeline
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.selected, 4);
    assert_eq!(summary.prepared, 4);
    assert_eq!(summary.acknowledged, 4);
    assert_eq!(summary.alerts, 6);
    assert_eq!(submission.submitted().len(), 4);
    assert_eq!(ledger_entry(&store, "6").attempt_count, 3);
}

#[tokio::test]
async fn test_settled_operations_do_not_hide_later_ones() {
    let store = Arc::new(MemoryStore::new());
    for id in 1..=21 {
        insert_approved_operation(&store, SHIPPING, id);
    }
    let submission = Arc::new(FakeSubmissionChannel::new(Vec::new()));
    let status = Arc::new(FakeStatusChannel::new());
    let pipeline = build_pipeline(&store, submission.clone(), status, 10);

    for _ in 0..2 {
        let summary = pipeline
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.acknowledged, 10);
    }

    // Twenty acknowledged operations sort ahead of the last one.
    let summary = pipeline
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.selected, 1);
    assert_eq!(summary.acknowledged, 1);
    assert!(matches!(
        ledger_entry(&store, "21").status,
        DispatchStatus::Acknowledged { .. }
    ));
    assert_eq!(submission.submitted().len(), 21);
}

#[tokio::test]
async fn test_unlisted_transactions_do_not_stall_reconciliation() {
    let store = Arc::new(MemoryStore::new());
    for id in 1..=60 {
        store.insert(
            LEDGER,
            json!({
                "id": id,
                "shipping_operation_id": (1000 + id).to_string(),
                "capture_id": format!("capture-{id}"),
                "status": "Acknowledged",
                "partner_transaction_id": format!("tx-{id}"),
                "dispatch_attempt_count": 1,
            }),
        );
    }
    let status = Arc::new(FakeStatusChannel::new().with_status("tx-55", Some(4), "Complete"));
    let submission = Arc::new(FakeSubmissionChannel::new(Vec::new()));
    let pipeline = build_pipeline(&store, submission, status, 10);

    let summary = pipeline
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.awaiting_confirmation, 50);
    assert_eq!(summary.confirmed, 0);

    // The records not reached yet are asked first next time.
    let summary = pipeline
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.confirmed, 1);
    assert_eq!(summary.awaiting_confirmation, 49);
    assert_eq!(summary.alerts, 0);

    let confirmed = ledger_entry(&store, "1055");
    assert!(confirmed.confirmed_at.is_some());
}
