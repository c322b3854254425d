//! Typed access to the dispatch ledger collection.
//!
//! Every mutation of a record is a read-modify-write against the store, serialised per
//! shipping operation by an async lock. Attempts are consumed by the executor, and by
//! document extraction when a candidate has nothing to send; the reconciler is the only
//! caller of `record_confirmation`.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use epcis_common::dispatch::{
    fields, ConfirmationState, ConfirmationStatus, DispatchRecord, DispatchStatus, RecordError,
    RecordId, TransactionId, ACKNOWLEDGED_LABELS,
};
use epcis_common::store::{DocumentStore, Fields, Filter, Query, StoreError};
use epcis_common::timestamp::format_timestamp;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::DispatchError;

/// Outcome of a submission as written to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Acknowledged {
        transaction_id: TransactionId,
        accepted_at: DateTime<Utc>,
    },
    Retrying {
        error: String,
        http_status: Option<u16>,
    },
    Failed {
        error: String,
        http_status: Option<u16>,
    },
}

/// What an attempt is about, for records that do not exist yet.
#[derive(Debug, Clone)]
pub struct AttemptTarget<'a> {
    pub shipping_operation_id: &'a RecordId,
    pub capture_id: &'a str,
    pub target_location: Option<&'a str>,
}

type OperationLocks = Mutex<HashMap<RecordId, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive access to the record of one shipping operation. The table entry goes away
/// with the last holder, so the table only tracks operations in flight.
struct OperationGuard<'a> {
    locks: &'a OperationLocks,
    shipping_operation_id: RecordId,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();

        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let unused = locks
            .get(&self.shipping_operation_id)
            .map_or(false, |lock| Arc::strong_count(lock) == 1);
        if unused {
            locks.remove(&self.shipping_operation_id);
        }
    }
}

pub struct DispatchLedger {
    store: Arc<dyn DocumentStore>,
    collection: String,
    locks: OperationLocks,
}

impl DispatchLedger {
    pub fn new(store: Arc<dyn DocumentStore>, collection: &str) -> Self {
        Self {
            store,
            collection: collection.to_owned(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    async fn lock_operation(&self, shipping_operation_id: &RecordId) -> OperationGuard<'_> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(shipping_operation_id.clone())
                .or_default()
                .clone()
        };

        OperationGuard {
            locks: &self.locks,
            shipping_operation_id: shipping_operation_id.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or_default()
    }

    /// Current records of the given shipping operations, keyed by shipping operation.
    /// Entries that cannot be decoded are returned as errors so callers can count them.
    pub async fn records_for(
        &self,
        shipping_operation_ids: &[RecordId],
    ) -> Result<HashMap<RecordId, Result<DispatchRecord, RecordError>>, DispatchError> {
        if shipping_operation_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let query = Query::filter(Filter::is_in(
            fields::SHIPPING_OPERATION_ID,
            shipping_operation_ids.iter().map(|id| id.as_str()),
        ))
        .limit(shipping_operation_ids.len() * 2);

        let rows = self.store.query_records(&self.collection, &query).await?;

        let mut records = HashMap::with_capacity(rows.len());
        for row in rows {
            let Some(shipping_operation_id) = row
                .get(fields::SHIPPING_OPERATION_ID)
                .and_then(RecordId::from_value)
            else {
                warn!(collection = %self.collection, "ledger entry without shipping operation");
                continue;
            };
            records
                .entry(shipping_operation_id)
                .or_insert_with(|| DispatchRecord::from_fields(&row));
        }

        Ok(records)
    }

    async fn find_one(&self, filter: Filter) -> Result<Option<Fields>, DispatchError> {
        let rows = self
            .store
            .query_records(&self.collection, &Query::filter(filter).limit(1))
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Consume one attempt before anything is sent: create the record at one attempt, or
    /// bump the count of the existing one, and mark it `Processing`.
    pub async fn begin_attempt(
        &self,
        target: AttemptTarget<'_>,
    ) -> Result<DispatchRecord, DispatchError> {
        let _guard = self.lock_operation(target.shipping_operation_id).await;

        let now = format_timestamp(Utc::now());
        let current = self
            .find_one(Filter::eq(
                fields::SHIPPING_OPERATION_ID,
                target.shipping_operation_id.as_str(),
            ))
            .await?;

        let Some(mut current) = current else {
            let mut record = Fields::new();
            record.insert(
                fields::SHIPPING_OPERATION_ID.to_owned(),
                json!(target.shipping_operation_id),
            );
            record.insert(fields::CAPTURE_ID.to_owned(), json!(target.capture_id));
            record.insert(fields::STATUS.to_owned(), json!("Processing"));
            record.insert(fields::ATTEMPT_COUNT.to_owned(), json!(1));
            record.insert(fields::TARGET_GLN.to_owned(), json!(target.target_location));
            record.insert(fields::DATE_CREATED.to_owned(), json!(now));
            record.insert(fields::LAST_ATTEMPT.to_owned(), json!(now));

            let id = self
                .store
                .create_record(&self.collection, record.clone())
                .await?;
            record.insert(fields::ID.to_owned(), json!(id));

            debug!(
                shipping_operation_id = %target.shipping_operation_id,
                record_id = %id,
                "created dispatch record"
            );
            return Ok(DispatchRecord::from_fields(&record)?);
        };

        let existing = DispatchRecord::from_fields(&current)?;
        if let DispatchStatus::Acknowledged { .. } = existing.status {
            return Err(DispatchError::AlreadyAcknowledged(existing.id.to_string()));
        }

        let mut patch = Fields::new();
        patch.insert(fields::STATUS.to_owned(), json!("Processing"));
        patch.insert(
            fields::ATTEMPT_COUNT.to_owned(),
            json!(existing.attempt_count + 1),
        );
        patch.insert(fields::LAST_ATTEMPT.to_owned(), json!(now));
        if let Some(location) = target.target_location {
            patch.insert(fields::TARGET_GLN.to_owned(), json!(location));
        }

        self.store
            .update_record(&self.collection, &existing.id, patch.clone())
            .await?;

        current.extend(patch);
        Ok(DispatchRecord::from_fields(&current)?)
    }

    /// Write the outcome of a submission. An acknowledged record is never moved back
    /// to a transient or failed state.
    pub async fn record_outcome(
        &self,
        record: &DispatchRecord,
        transition: Transition,
    ) -> Result<DispatchRecord, DispatchError> {
        let _guard = self.lock_operation(&record.shipping_operation_id).await;

        let mut current = self
            .find_one(Filter::eq(fields::ID, record.id.as_str()))
            .await?
            .ok_or_else(|| StoreError::NotFound {
                collection: self.collection.clone(),
                id: record.id.to_string(),
            })?;
        let existing = DispatchRecord::from_fields(&current)?;

        let mut patch = Fields::new();
        match (&existing.status, transition) {
            (DispatchStatus::Acknowledged { .. }, transition) => {
                warn!(
                    record_id = %existing.id,
                    ?transition,
                    "ignoring outcome for an acknowledged record"
                );
                return Ok(existing);
            }
            (
                _,
                Transition::Acknowledged {
                    transaction_id,
                    accepted_at,
                },
            ) => {
                patch.insert(fields::STATUS.to_owned(), json!("Acknowledged"));
                patch.insert(
                    fields::TRANSACTION_ID.to_owned(),
                    json!(transaction_id.as_str()),
                );
                patch.insert(fields::HTTP_STATUS_CODE.to_owned(), json!(200));
                patch.insert(
                    fields::DATE_ACKNOWLEDGED.to_owned(),
                    json!(format_timestamp(accepted_at)),
                );
                patch.insert(
                    fields::DATE_DISPATCHED.to_owned(),
                    json!(format_timestamp(Utc::now())),
                );
                patch.insert(fields::LAST_ERROR.to_owned(), Value::Null);
            }
            (_, Transition::Retrying { error, http_status }) => {
                patch.insert(fields::STATUS.to_owned(), json!("Retrying"));
                patch.insert(fields::LAST_ERROR.to_owned(), json!(error));
                patch.insert(fields::HTTP_STATUS_CODE.to_owned(), json!(http_status));
            }
            (_, Transition::Failed { error, http_status }) => {
                patch.insert(fields::STATUS.to_owned(), json!("Failed"));
                patch.insert(fields::LAST_ERROR.to_owned(), json!(error));
                patch.insert(fields::HTTP_STATUS_CODE.to_owned(), json!(http_status));
            }
        }

        self.store
            .update_record(&self.collection, &existing.id, patch.clone())
            .await?;

        current.extend(patch);
        Ok(DispatchRecord::from_fields(&current)?)
    }

    /// Store the partner-side status of an acknowledged record. The confirmation date is
    /// only set once the partner reports delivery.
    pub async fn record_confirmation(
        &self,
        record: &DispatchRecord,
        status: &ConfirmationStatus,
    ) -> Result<(), DispatchError> {
        let _guard = self.lock_operation(&record.shipping_operation_id).await;

        let mut patch = Fields::new();
        patch.insert(
            fields::PARTNER_STATUS.to_owned(),
            json!(status.state.label()),
        );
        patch.insert(
            fields::PARTNER_STATUS_MSG.to_owned(),
            json!(status.status_message),
        );
        patch.insert(
            fields::PARTNER_STATUS_UPDATED.to_owned(),
            json!(format_timestamp(status.checked_at)),
        );
        if status.delivered() {
            patch.insert(
                fields::DATE_CONFIRMED.to_owned(),
                json!(format_timestamp(status.checked_at)),
            );
        }

        self.store
            .update_record(&self.collection, &record.id, patch)
            .await?;
        Ok(())
    }

    /// Consume an attempt for an operation that had nothing to send, and fail it with
    /// the reason. It is offered again until its attempts run out.
    pub async fn record_unprepared(
        &self,
        target: AttemptTarget<'_>,
        error: &str,
    ) -> Result<DispatchRecord, DispatchError> {
        let record = self.begin_attempt(target).await?;
        self.record_outcome(
            &record,
            Transition::Failed {
                error: error.to_owned(),
                http_status: None,
            },
        )
        .await
    }

    /// Acknowledged records whose partner status is not settled yet. Records never
    /// checked come first, then the ones checked longest ago, so a handful of records
    /// the partner cannot answer for do not hide the rest.
    pub async fn unconfirmed_acknowledged(
        &self,
        limit: usize,
    ) -> Result<Vec<DispatchRecord>, DispatchError> {
        let awaiting = |checked: Filter| {
            Filter::And(vec![
                Filter::is_in(fields::STATUS, ACKNOWLEDGED_LABELS),
                Filter::not_null(fields::TRANSACTION_ID),
                Filter::Or(vec![
                    Filter::is_null(fields::PARTNER_STATUS),
                    Filter::eq(fields::PARTNER_STATUS, ConfirmationState::Pending.label()),
                ]),
                checked,
            ])
        };

        let mut records = self
            .decoded(
                Query::filter(awaiting(Filter::is_null(fields::PARTNER_STATUS_UPDATED)))
                    .sort(&[fields::ID])
                    .limit(limit),
            )
            .await?;

        if records.len() < limit {
            let checked_before = self
                .decoded(
                    Query::filter(awaiting(Filter::not_null(fields::PARTNER_STATUS_UPDATED)))
                        .sort(&[fields::PARTNER_STATUS_UPDATED])
                        .limit(limit - records.len()),
                )
                .await?;
            records.extend(checked_before);
        }

        Ok(records)
    }

    /// Records that failed and have no attempts left.
    pub async fn exhausted_failures(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<DispatchRecord>, DispatchError> {
        let query = Query::filter(Filter::eq(fields::STATUS, "Failed")).limit(limit);

        Ok(self
            .decoded(query)
            .await?
            .into_iter()
            .filter(|record| record.attempt_count >= max_attempts)
            .collect())
    }

    async fn decoded(&self, query: Query) -> Result<Vec<DispatchRecord>, DispatchError> {
        let rows = self.store.query_records(&self.collection, &query).await?;

        Ok(rows
            .iter()
            .filter_map(|row| match DispatchRecord::from_fields(row) {
                Ok(record) => Some(record),
                Err(error) => {
                    warn!(
                        collection = %self.collection,
                        "skipping undecodable ledger entry: {}",
                        error
                    );
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epcis_common::store::MemoryStore;

    const LEDGER: &str = "EPCIS_outbound";

    fn ledger() -> (Arc<MemoryStore>, DispatchLedger) {
        let store = Arc::new(MemoryStore::new());
        let ledger = DispatchLedger::new(store.clone(), LEDGER);
        (store, ledger)
    }

    fn target(id: &RecordId) -> AttemptTarget<'_> {
        AttemptTarget {
            shipping_operation_id: id,
            capture_id: "capture-1",
            target_location: Some("0300011111116"),
        }
    }

    #[tokio::test]
    async fn test_begin_attempt_creates_then_increments() {
        let (store, ledger) = ledger();
        let op = RecordId::from(5);

        let first = ledger.begin_attempt(target(&op)).await.unwrap();
        assert_eq!(first.attempt_count, 1);
        assert_eq!(first.status, DispatchStatus::Processing);
        assert_eq!(first.shipping_operation_id, op);
        assert_eq!(first.target_location.as_deref(), Some("0300011111116"));

        let second = ledger.begin_attempt(target(&op)).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt_count, 2);
        assert_eq!(store.records(LEDGER).len(), 1);
    }

    #[tokio::test]
    async fn test_acknowledged_is_never_clobbered() {
        let (_, ledger) = ledger();
        let op = RecordId::from(5);
        let record = ledger.begin_attempt(target(&op)).await.unwrap();

        let acknowledged = ledger
            .record_outcome(
                &record,
                Transition::Acknowledged {
                    transaction_id: TransactionId::new("tx-1").unwrap(),
                    accepted_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert_eq!(acknowledged.transaction_id().unwrap().as_str(), "tx-1");
        assert_eq!(acknowledged.http_status_code, Some(200));
        assert!(acknowledged.dispatched_at.is_some());

        let stale = ledger
            .record_outcome(
                &record,
                Transition::Retrying {
                    error: "late timeout".to_owned(),
                    http_status: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(stale.status, acknowledged.status);

        assert!(matches!(
            ledger.begin_attempt(target(&op)).await,
            Err(DispatchError::AlreadyAcknowledged(_))
        ));
    }

    #[tokio::test]
    async fn test_failure_outcomes_keep_error_detail() {
        let (_, ledger) = ledger();
        let op = RecordId::from("op-9");
        let record = ledger.begin_attempt(target(&op)).await.unwrap();

        let failed = ledger
            .record_outcome(
                &record,
                Transition::Failed {
                    error: "schema validation failed".to_owned(),
                    http_status: Some(422),
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.status, DispatchStatus::Failed);
        assert_eq!(failed.http_status_code, Some(422));
        assert_eq!(failed.last_error.as_deref(), Some("schema validation failed"));
        assert_eq!(failed.attempt_count, 1);

        let exhausted = ledger.exhausted_failures(1, 100).await.unwrap();
        assert_eq!(exhausted.len(), 1);
        assert!(ledger.exhausted_failures(3, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_attempts_do_not_lose_increments() {
        let (_, ledger) = ledger();
        let ledger = Arc::new(ledger);
        let op = RecordId::from(77);
        ledger.begin_attempt(target(&op)).await.unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ledger = ledger.clone();
                let op = op.clone();
                tokio::spawn(async move { ledger.begin_attempt(target(&op)).await.unwrap() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let records = ledger.records_for(&[op.clone()]).await.unwrap();
        let record = records.get(&op).unwrap().as_ref().unwrap();
        assert_eq!(record.attempt_count, 5);
    }

    #[tokio::test]
    async fn test_confirmation_and_unconfirmed_query() {
        let (store, ledger) = ledger();
        store.insert(
            LEDGER,
            json!({
                "id": 1, "shipping_operation_id": 10, "status": "Sent",
                "partner_transaction_id": "tx-a", "dispatch_attempt_count": 1,
            }),
        );
        store.insert(
            LEDGER,
            json!({
                "id": 2, "shipping_operation_id": 11, "status": "Acknowledged",
                "partner_transaction_id": "tx-b", "partner_status": "confirmed",
            }),
        );
        store.insert(
            LEDGER,
            json!({"id": 3, "shipping_operation_id": 12, "status": "Retrying"}),
        );

        let unconfirmed = ledger.unconfirmed_acknowledged(50).await.unwrap();
        assert_eq!(unconfirmed.len(), 1);
        assert_eq!(unconfirmed[0].id, RecordId::from(1));

        let delivered = ConfirmationStatus::from_partner(Some(4), "Complete", Utc::now());
        ledger
            .record_confirmation(&unconfirmed[0], &delivered)
            .await
            .unwrap();

        let updates = store.updates(LEDGER);
        assert_eq!(updates.len(), 1);
        let (id, patch) = &updates[0];
        assert_eq!(id, &RecordId::from(1));
        assert_eq!(patch.get("partner_status"), Some(&json!("confirmed")));
        assert!(patch.contains_key("date_confirmed"));
        assert!(!patch.contains_key("dispatch_attempt_count"));
        assert!(ledger.unconfirmed_acknowledged(50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backlog_prefers_least_recently_checked() {
        let (store, ledger) = ledger();
        let checked = [
            (1, Some("2024-03-03T00:00:00.000Z")),
            (2, Some("2024-03-01T00:00:00.000Z")),
            (3, None),
            (4, Some("2024-03-02T00:00:00.000Z")),
        ];
        for (id, updated) in checked {
            store.insert(
                LEDGER,
                json!({
                    "id": id, "shipping_operation_id": 10 + id, "status": "Acknowledged",
                    "partner_transaction_id": format!("tx-{id}"),
                    "partner_status": updated.map(|_| "pending"),
                    "partner_status_updated": updated,
                }),
            );
        }

        let ids = |records: Vec<DispatchRecord>| -> Vec<RecordId> {
            records.into_iter().map(|record| record.id).collect()
        };
        assert_eq!(
            ids(ledger.unconfirmed_acknowledged(3).await.unwrap()),
            vec![RecordId::from(3), RecordId::from(2), RecordId::from(4)]
        );
        assert_eq!(
            ids(ledger.unconfirmed_acknowledged(1).await.unwrap()),
            vec![RecordId::from(3)]
        );
    }

    #[tokio::test]
    async fn test_unprepared_operation_consumes_an_attempt() {
        let (_, ledger) = ledger();
        let op = RecordId::from(8);

        let failed = ledger
            .record_unprepared(target(&op), "shipping operation 8 has no prepared document")
            .await
            .unwrap();
        assert_eq!(failed.status, DispatchStatus::Failed);
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(
            failed.last_error.as_deref(),
            Some("shipping operation 8 has no prepared document")
        );

        let again = ledger
            .record_unprepared(target(&op), "still missing")
            .await
            .unwrap();
        assert_eq!(again.id, failed.id);
        assert_eq!(again.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_lock_table_only_tracks_operations_in_flight() {
        let (_, ledger) = ledger();
        let ledger = Arc::new(ledger);

        let handles: Vec<_> = (0..20)
            .map(|n| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    let op = RecordId::from(n % 5);
                    ledger.begin_attempt(target(&op)).await.unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(ledger.tracked_locks(), 0);
        let records = ledger.records_for(&[RecordId::from(0)]).await.unwrap();
        let record = records.get(&RecordId::from(0)).unwrap().as_ref().unwrap();
        assert_eq!(record.attempt_count, 4);
    }

    #[tokio::test]
    async fn test_pending_confirmation_has_no_confirmed_date() {
        let (store, ledger) = ledger();
        store.insert(
            LEDGER,
            json!({
                "id": 1, "shipping_operation_id": 10, "status": "Acknowledged",
                "partner_transaction_id": "tx-a",
            }),
        );
        let record = ledger.unconfirmed_acknowledged(50).await.unwrap().remove(0);

        let pending = ConfirmationStatus::from_partner(Some(1), "Queued", Utc::now());
        ledger.record_confirmation(&record, &pending).await.unwrap();

        let (_, patch) = store.updates(LEDGER).remove(0);
        assert_eq!(patch.get("partner_status"), Some(&json!("pending")));
        assert!(!patch.contains_key("date_confirmed"));
    }
}
