use std::sync::Arc;

use async_trait::async_trait;
use epcis_common::batch::{BatchGuard, FailureThreshold};
use epcis_common::dispatch::RecordId;
use epcis_common::gs1::parse_location;
use epcis_common::store::{DocumentStore, StoreError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::DispatchError;
use crate::ledger::{AttemptTarget, DispatchLedger};
use crate::selector::{DispatchCandidate, ShippingOperation};

/// A ready-to-send payload and where it is going.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchDocument {
    pub payload: Vec<u8>,
    pub target_location: String,
}

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("shipping operation {0} has no prepared document")]
    MissingDocument(RecordId),
    #[error("prepared document of shipping operation {0} is empty")]
    EmptyDocument(RecordId),
    #[error("no receiver location for shipping operation {0}")]
    MissingTargetLocation(RecordId),
    #[error("could not read prepared document: {0}")]
    Store(#[from] StoreError),
}

/// Supplies the built document of a shipping operation. Building it is someone else's job.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn document_for(
        &self,
        operation: &ShippingOperation,
    ) -> Result<DispatchDocument, DocumentError>;
}

/// Reads the prepared document file referenced by the shipping operation.
pub struct StoredDocumentSource {
    store: Arc<dyn DocumentStore>,
    default_receiver: Option<String>,
}

impl StoredDocumentSource {
    pub fn new(store: Arc<dyn DocumentStore>, default_receiver: Option<String>) -> Self {
        Self {
            store,
            default_receiver,
        }
    }
}

#[async_trait]
impl DocumentSource for StoredDocumentSource {
    async fn document_for(
        &self,
        operation: &ShippingOperation,
    ) -> Result<DispatchDocument, DocumentError> {
        let target_location = resolve_target_location(
            operation.receiver.as_deref(),
            self.default_receiver.as_deref(),
        )
        .ok_or_else(|| DocumentError::MissingTargetLocation(operation.id.clone()))?;

        let file_id = operation
            .document_file_id
            .as_deref()
            .ok_or_else(|| DocumentError::MissingDocument(operation.id.clone()))?;
        let payload = self.store.read_file(file_id).await?;
        if payload.is_empty() {
            return Err(DocumentError::EmptyDocument(operation.id.clone()));
        }

        Ok(DispatchDocument {
            payload,
            target_location,
        })
    }
}

/// Routing GLN for a receiver given as SGLN URN, digital link or plain GLN.
/// An unparseable receiver is kept verbatim; without one the default receiver is used.
pub fn resolve_target_location(receiver: Option<&str>, default: Option<&str>) -> Option<String> {
    let raw = receiver
        .filter(|r| !r.trim().is_empty())
        .or(default.filter(|d| !d.trim().is_empty()))?
        .trim();

    match parse_location(raw) {
        gln if gln.is_empty() => Some(raw.to_owned()),
        gln => Some(gln),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedDispatch {
    pub candidate: DispatchCandidate,
    pub document: DispatchDocument,
}

/// Fetch the document of every candidate. A candidate without a usable document is
/// dropped from the batch and fails one attempt in the ledger, so it stops being
/// offered once its attempts are used up.
pub async fn extract_documents(
    source: &dyn DocumentSource,
    ledger: &DispatchLedger,
    candidates: Vec<DispatchCandidate>,
    threshold: FailureThreshold,
    cancel: &CancellationToken,
) -> Result<Vec<PreparedDispatch>, DispatchError> {
    let mut guard = BatchGuard::new("extract_documents", threshold);
    let mut prepared = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            fetched = source.document_for(&candidate.operation) => fetched,
        };

        match fetched {
            Ok(document) => {
                guard.record_success();
                prepared.push(PreparedDispatch {
                    candidate,
                    document,
                });
            }
            Err(error) => {
                guard.record_failure(&candidate.operation.id, &error);

                let target = AttemptTarget {
                    shipping_operation_id: &candidate.operation.id,
                    capture_id: &candidate.operation.capture_id,
                    target_location: None,
                };
                let recorded = ledger.record_unprepared(target, &error.to_string()).await;
                if let Err(ledger_error) = recorded {
                    warn!(
                        shipping_operation_id = %candidate.operation.id,
                        "failed to record extraction error: {}",
                        ledger_error
                    );
                }
            }
        }
    }

    let summary = guard.finish()?;
    info!(
        prepared = summary.succeeded,
        failed = summary.failed,
        "extracted dispatch documents"
    );
    Ok(prepared)
}
