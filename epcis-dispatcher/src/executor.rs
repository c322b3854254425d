use std::sync::Arc;
use std::time::Instant;

use epcis_common::batch::BatchGuard;
use epcis_common::dispatch::{DispatchRecord, DispatchStatus};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::document::{DispatchDocument, PreparedDispatch};
use crate::error::{ChannelError, DispatchError};
use crate::ledger::{AttemptTarget, DispatchLedger, Transition};
use crate::partner::SubmissionChannel;
use crate::selector::{DispatchSettings, ShippingOperation};

/// What became of one submission, as written to its record.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    pub operation: ShippingOperation,
    pub record: DispatchRecord,
    pub transition: Transition,
}

impl DispatchResult {
    pub fn outcome(&self) -> &'static str {
        match self.transition {
            Transition::Acknowledged { .. } => "acknowledged",
            Transition::Retrying { .. } => "retrying",
            Transition::Failed { .. } => "failed",
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        matches!(self.record.status, DispatchStatus::Acknowledged { .. })
    }

    /// Failed for good in this attempt, either rejected or out of attempts.
    pub fn is_permanent_failure(&self) -> bool {
        matches!(self.transition, Transition::Failed { .. })
    }
}

/// Decide the transition for a failed submission. Client errors fail straight away,
/// everything else is retried until the attempts run out. Cancellation has no transition.
pub fn classify_failure(
    error: &ChannelError,
    attempt_count: u32,
    max_attempts: u32,
) -> Option<Transition> {
    if matches!(error, ChannelError::Cancelled) {
        return None;
    }

    let message = error.to_string();
    let http_status = error.status_code();
    if error.is_permanent() || attempt_count >= max_attempts {
        Some(Transition::Failed {
            error: message,
            http_status,
        })
    } else {
        Some(Transition::Retrying {
            error: message,
            http_status,
        })
    }
}

pub struct DispatchExecutor {
    ledger: Arc<DispatchLedger>,
    channel: Arc<dyn SubmissionChannel>,
}

impl DispatchExecutor {
    pub fn new(ledger: Arc<DispatchLedger>, channel: Arc<dyn SubmissionChannel>) -> Self {
        Self { ledger, channel }
    }

    /// Submit every prepared document, at most `batch_size` at a time, and record each
    /// outcome. Any non-acknowledged outcome counts against the failure threshold.
    pub async fn dispatch(
        &self,
        prepared: Vec<PreparedDispatch>,
        settings: &DispatchSettings,
        cancel: &CancellationToken,
    ) -> Result<Vec<DispatchResult>, DispatchError> {
        if prepared.is_empty() {
            return Ok(Vec::new());
        }

        let outcomes: Vec<_> = stream::iter(prepared)
            .map(|item| self.dispatch_one(item, settings.max_attempts, cancel))
            .buffered(settings.batch_size.max(1))
            .collect()
            .await;

        let mut guard = BatchGuard::new("dispatch", settings.failure_threshold);
        let mut results = Vec::with_capacity(outcomes.len());

        for (operation, outcome) in outcomes {
            match outcome {
                Ok(result) => {
                    if result.is_acknowledged() {
                        guard.record_success();
                    } else {
                        guard.record_failure(&operation.id, &result.outcome());
                    }
                    results.push(result);
                }
                Err(DispatchError::Cancelled) => return Err(DispatchError::Cancelled),
                Err(DispatchError::AlreadyAcknowledged(record_id)) => {
                    info!(
                        shipping_operation_id = %operation.id,
                        record_id = %record_id,
                        "already acknowledged, nothing sent"
                    );
                }
                Err(error) => guard.record_failure(&operation.id, &error),
            }
        }

        let summary = guard.finish()?;
        info!(
            attempted = summary.attempted,
            acknowledged = summary.succeeded,
            "dispatched documents"
        );
        Ok(results)
    }

    async fn dispatch_one(
        &self,
        item: PreparedDispatch,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> (ShippingOperation, Result<DispatchResult, DispatchError>) {
        let operation = item.candidate.operation;
        let result = self
            .attempt(&operation, &item.document, max_attempts, cancel)
            .await;
        (operation, result)
    }

    async fn attempt(
        &self,
        operation: &ShippingOperation,
        document: &DispatchDocument,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<DispatchResult, DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let record = self
            .ledger
            .begin_attempt(AttemptTarget {
                shipping_operation_id: &operation.id,
                capture_id: &operation.capture_id,
                target_location: Some(&document.target_location),
            })
            .await?;
        metrics::counter!("epcis_dispatch_attempts_total").increment(1);

        let started = Instant::now();
        let transition = match self.channel.submit(document, cancel).await {
            Ok(submission) => Transition::Acknowledged {
                transaction_id: submission.transaction_id,
                accepted_at: submission.accepted_at,
            },
            Err(error) => {
                let Some(transition) =
                    classify_failure(&error, record.attempt_count, max_attempts)
                else {
                    // The attempt stays consumed and the record stays Processing.
                    return Err(DispatchError::Cancelled);
                };
                match &transition {
                    Transition::Failed { .. } => error!(
                        shipping_operation_id = %operation.id,
                        attempt_count = record.attempt_count,
                        "dispatch failed permanently: {}",
                        error
                    ),
                    _ => warn!(
                        shipping_operation_id = %operation.id,
                        attempt_count = record.attempt_count,
                        "dispatch failed, will retry: {}",
                        error
                    ),
                }
                transition
            }
        };

        let record = self
            .ledger
            .record_outcome(&record, transition.clone())
            .await?;
        let result = DispatchResult {
            operation: operation.clone(),
            record,
            transition,
        };

        let labels = [("outcome", result.outcome())];
        metrics::counter!("epcis_dispatch_outcomes_total", &labels).increment(1);
        metrics::histogram!("epcis_dispatch_duration_seconds", &labels)
            .record(started.elapsed().as_secs_f64());

        Ok(result)
    }
}
