use std::sync::Arc;

use epcis_common::batch::FailureThreshold;
use epcis_common::dispatch::{DispatchRecord, DispatchStatus, RecordError, RecordId};
use epcis_common::store::{DocumentStore, Fields, Filter, Query};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::DispatchError;
use crate::ledger::DispatchLedger;
use crate::reconciler::DEFAULT_CONFIRMATION_WINDOW_DAYS;

/// Field names of a shipping operation.
pub mod fields {
    pub const ID: &str = "id";
    pub const CAPTURE_ID: &str = "capture_id";
    pub const STATUS: &str = "status";
    pub const DOCUMENT_FILE_ID: &str = "epcis_xml_file_id";
    pub const RECEIVER: &str = "receiver_location";
}

/// Shipping operations in this state are waiting to be sent.
pub const APPROVED: &str = "approved";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchSettings {
    /// Upper bound of candidates per cycle, and of concurrent submissions.
    pub batch_size: usize,
    pub max_attempts: u32,
    pub failure_threshold: FailureThreshold,
    /// Days an acknowledged transaction may stay unlisted by the partner.
    pub confirmation_window_days: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_attempts: 3,
            failure_threshold: FailureThreshold::default(),
            confirmation_window_days: DEFAULT_CONFIRMATION_WINDOW_DAYS,
        }
    }
}

/// An approved shipping operation as read from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ShippingOperation {
    pub id: RecordId,
    pub capture_id: String,
    pub document_file_id: Option<String>,
    pub receiver: Option<String>,
}

impl ShippingOperation {
    pub fn from_fields(record: &Fields) -> Result<Self, RecordError> {
        let id = record
            .get(fields::ID)
            .and_then(RecordId::from_value)
            .ok_or(RecordError::MissingField(fields::ID))?;
        let capture_id =
            text(record, fields::CAPTURE_ID).ok_or(RecordError::MissingField(fields::CAPTURE_ID))?;

        Ok(Self {
            id,
            capture_id,
            document_file_id: text(record, fields::DOCUMENT_FILE_ID),
            receiver: text(record, fields::RECEIVER),
        })
    }
}

fn text(record: &Fields, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
        _ => None,
    }
}

/// A shipping operation due for a transmission attempt, with its ledger entry if any.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchCandidate {
    pub operation: ShippingOperation,
    pub record: Option<DispatchRecord>,
}

impl DispatchCandidate {
    pub fn attempt_count(&self) -> u32 {
        self.record.as_ref().map_or(0, |r| r.attempt_count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// Never attempted.
    Fresh,
    /// A previous attempt was interrupted before its outcome was written.
    Resume,
    /// Failed before and still has attempts left.
    Retry,
    AlreadyAcknowledged,
    Exhausted,
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        match self {
            Eligibility::Fresh | Eligibility::Resume | Eligibility::Retry => true,
            Eligibility::AlreadyAcknowledged | Eligibility::Exhausted => false,
        }
    }
}

pub fn eligibility(record: Option<&DispatchRecord>, max_attempts: u32) -> Eligibility {
    let Some(record) = record else {
        return Eligibility::Fresh;
    };

    match record.status {
        DispatchStatus::Acknowledged { .. } => Eligibility::AlreadyAcknowledged,
        DispatchStatus::Failed | DispatchStatus::Retrying => {
            if record.attempt_count < max_attempts {
                Eligibility::Retry
            } else {
                Eligibility::Exhausted
            }
        }
        DispatchStatus::Pending | DispatchStatus::Processing => Eligibility::Resume,
    }
}

/// Reads approved shipping operations and the ledger. Never writes.
pub struct CandidateSelector {
    store: Arc<dyn DocumentStore>,
    shipping_collection: String,
    ledger: Arc<DispatchLedger>,
}

impl CandidateSelector {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        shipping_collection: &str,
        ledger: Arc<DispatchLedger>,
    ) -> Self {
        Self {
            store,
            shipping_collection: shipping_collection.to_owned(),
            ledger,
        }
    }

    /// Pick up to `batch_size` operations needing an attempt, in id order.
    ///
    /// Approved operations stay approved once delivered, so the store is read a page at
    /// a time until the batch is full or every approved operation has been looked at.
    /// Operations past the batch size are left for the next cycle.
    pub async fn select(
        &self,
        settings: &DispatchSettings,
        cancel: &CancellationToken,
    ) -> Result<Vec<DispatchCandidate>, DispatchError> {
        let batch_size = settings.batch_size.max(1);
        let page_size = batch_size * 2;

        let mut candidates = Vec::with_capacity(batch_size);
        let mut scanned = 0;
        let mut skipped_acknowledged = 0;
        let mut skipped_exhausted = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            let query = Query::filter(Filter::eq(fields::STATUS, APPROVED))
                .fields(&[
                    fields::ID,
                    fields::CAPTURE_ID,
                    fields::STATUS,
                    fields::DOCUMENT_FILE_ID,
                    fields::RECEIVER,
                ])
                .sort(&[fields::ID])
                .limit(page_size)
                .offset(scanned);
            let rows = self
                .store
                .query_records(&self.shipping_collection, &query)
                .await?;
            scanned += rows.len();

            let operations: Vec<ShippingOperation> = rows
                .iter()
                .filter_map(|row| match ShippingOperation::from_fields(row) {
                    Ok(operation) => Some(operation),
                    Err(error) => {
                        warn!("skipping shipping operation: {}", error);
                        None
                    }
                })
                .collect();

            if !operations.is_empty() {
                let ids: Vec<RecordId> = operations.iter().map(|op| op.id.clone()).collect();
                let mut records = self.ledger.records_for(&ids).await?;

                for operation in operations {
                    if candidates.len() >= batch_size {
                        break;
                    }

                    let record = match records.remove(&operation.id) {
                        None => None,
                        Some(Ok(record)) => Some(record),
                        Some(Err(error)) => {
                            // Unknown state might be a delivered one, leave it to an operator.
                            warn!(
                                shipping_operation_id = %operation.id,
                                "unreadable dispatch record: {}",
                                error
                            );
                            continue;
                        }
                    };

                    match eligibility(record.as_ref(), settings.max_attempts) {
                        Eligibility::AlreadyAcknowledged => skipped_acknowledged += 1,
                        Eligibility::Exhausted => skipped_exhausted += 1,
                        Eligibility::Fresh | Eligibility::Resume | Eligibility::Retry => {
                            candidates.push(DispatchCandidate { operation, record })
                        }
                    }
                }
            }

            if candidates.len() >= batch_size || rows.len() < page_size {
                break;
            }
        }

        info!(
            count = candidates.len(),
            batch_size,
            scanned,
            skipped_acknowledged,
            skipped_exhausted,
            "selected dispatch candidates"
        );

        Ok(candidates)
    }
}
