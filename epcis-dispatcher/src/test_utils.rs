use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use epcis_common::dispatch::TransactionId;
use epcis_common::store::MemoryStore;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::document::DispatchDocument;
use crate::error::ChannelError;
use crate::partner::{cancellable, PartnerStatus, StatusChannel, Submission, SubmissionChannel};

/// One scripted answer of a `FakeSubmissionChannel`.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Accept(String),
    Reject(u16),
    Unavailable(u16),
    Timeout,
    /// Never answers; only cancellation ends the call.
    Hang,
}

/// Submission channel answering from a script, then accepting everything once the
/// script runs out.
#[derive(Default)]
pub struct FakeSubmissionChannel {
    script: Mutex<VecDeque<ScriptedResponse>>,
    submitted: Mutex<Vec<DispatchDocument>>,
}

impl FakeSubmissionChannel {
    pub fn new(script: Vec<ScriptedResponse>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn submitted(&self) -> Vec<DispatchDocument> {
        self.submitted
            .lock()
            .map(|submitted| submitted.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SubmissionChannel for FakeSubmissionChannel {
    async fn submit(
        &self,
        document: &DispatchDocument,
        cancel: &CancellationToken,
    ) -> Result<Submission, ChannelError> {
        let count = {
            let mut submitted = self.submitted.lock().map_err(|_| {
                ChannelError::Configuration("fake channel lock poisoned".to_owned())
            })?;
            submitted.push(document.clone());
            submitted.len()
        };
        let next = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| ScriptedResponse::Accept(format!("tx-{count}")));

        match next {
            ScriptedResponse::Accept(id) => Ok(Submission {
                transaction_id: TransactionId::new(id)
                    .ok_or_else(|| ChannelError::Decode("empty transaction id".to_owned()))?,
                accepted_at: Utc::now(),
            }),
            ScriptedResponse::Reject(status) => Err(ChannelError::Rejected {
                status,
                message: "rejected by fake partner".to_owned(),
            }),
            ScriptedResponse::Unavailable(status) => Err(ChannelError::Unavailable {
                status,
                message: "fake partner unavailable".to_owned(),
            }),
            ScriptedResponse::Timeout => Err(ChannelError::Timeout),
            ScriptedResponse::Hang => {
                cancellable(cancel, futures::future::pending::<Result<Submission, ChannelError>>())
                    .await
            }
        }
    }
}

/// Status channel answering from a fixed table. Unknown transactions are not found.
#[derive(Default)]
pub struct FakeStatusChannel {
    statuses: HashMap<String, PartnerStatus>,
    queried: Mutex<Vec<String>>,
}

impl FakeStatusChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, transaction_id: &str, code: Option<i64>, message: &str) -> Self {
        self.statuses.insert(
            transaction_id.to_owned(),
            PartnerStatus {
                status_code: code,
                status_message: message.to_owned(),
            },
        );
        self
    }

    pub fn queried(&self) -> Vec<String> {
        self.queried
            .lock()
            .map(|queried| queried.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StatusChannel for FakeStatusChannel {
    async fn query_status(
        &self,
        transaction_id: &TransactionId,
        cancel: &CancellationToken,
    ) -> Result<PartnerStatus, ChannelError> {
        if cancel.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }
        if let Ok(mut queried) = self.queried.lock() {
            queried.push(transaction_id.to_string());
        }

        self.statuses
            .get(transaction_id.as_str())
            .cloned()
            .ok_or_else(|| ChannelError::NotFound(transaction_id.to_string()))
    }
}

/// Seed an approved shipping operation with its prepared document.
pub fn insert_approved_operation(store: &MemoryStore, collection: &str, id: i64) {
    let file_id = format!("file-{id}");
    store.insert(
        collection,
        json!({
            "id": id,
            "capture_id": format!("capture-{id}"),
            "status": "approved",
            "epcis_xml_file_id": file_id,
            "receiver_location": "urn:epc:id:sgln:030001.111111.0",
        }),
    );
    store.insert_file(&file_id, format!("<epcis:EPCISDocument id=\"{id}\"/>"));
}
