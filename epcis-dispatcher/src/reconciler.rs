use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use epcis_common::batch::{BatchGuard, FailureThreshold};
use epcis_common::dispatch::{
    ConfirmationState, ConfirmationStatus, DispatchRecord, TransactionId,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ChannelError, DispatchError};
use crate::executor::DispatchResult;
use crate::ledger::DispatchLedger;
use crate::partner::StatusChannel;

/// Previously acknowledged records checked per cycle, on top of the fresh ones.
pub const DEFAULT_BACKLOG_LIMIT: usize = 50;
/// How long the partner log is searched back, and so how long an acknowledged
/// transaction may stay unlisted before it is given up on.
pub const DEFAULT_CONFIRMATION_WINDOW_DAYS: u32 = 90;

/// The partner's verdict on one acknowledged record.
#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    pub record: DispatchRecord,
    pub status: ConfirmationStatus,
}

/// Records to check this cycle: the ones acknowledged just now, then the backlog.
/// A record appearing in both is checked once.
pub fn merge_targets(
    recent: &[DispatchResult],
    backlog: Vec<DispatchRecord>,
) -> Vec<DispatchRecord> {
    let mut seen = HashSet::new();

    recent
        .iter()
        .filter(|result| result.is_acknowledged())
        .map(|result| result.record.clone())
        .chain(backlog)
        .filter(DispatchRecord::awaiting_confirmation)
        .filter(|record| seen.insert(record.id.clone()))
        .collect()
}

pub struct ConfirmationReconciler {
    ledger: Arc<DispatchLedger>,
    channel: Arc<dyn StatusChannel>,
    backlog_limit: usize,
    confirmation_window: Duration,
}

impl ConfirmationReconciler {
    pub fn new(ledger: Arc<DispatchLedger>, channel: Arc<dyn StatusChannel>) -> Self {
        Self {
            ledger,
            channel,
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
            confirmation_window: Duration::days(i64::from(DEFAULT_CONFIRMATION_WINDOW_DAYS)),
        }
    }

    pub fn with_confirmation_window(mut self, window: Duration) -> Self {
        self.confirmation_window = window;
        self
    }

    /// A transaction the partner log does not list yet stays pending, until it was
    /// acknowledged longer ago than the log is searched. Then it will never show up.
    fn unlisted(&self, record: &DispatchRecord, now: DateTime<Utc>) -> ConfirmationStatus {
        let sent_at = record.acknowledged_at.or(record.dispatched_at);
        let expired = sent_at.map_or(false, |at| now - at > self.confirmation_window);

        let (state, status_message) = if expired {
            (
                ConfirmationState::Failed,
                format!(
                    "not listed in partner log within {} days of acknowledgement",
                    self.confirmation_window.num_days()
                ),
            )
        } else {
            (
                ConfirmationState::Pending,
                "not listed in partner log yet".to_owned(),
            )
        };

        ConfirmationStatus {
            state,
            status_code: None,
            status_message,
            checked_at: now,
        }
    }

    /// Ask the partner about every acknowledged record without a settled status and
    /// store the answer. Pending answers are asked again next cycle, after the records
    /// that have waited longest.
    pub async fn reconcile(
        &self,
        recent: &[DispatchResult],
        threshold: FailureThreshold,
        cancel: &CancellationToken,
    ) -> Result<Vec<Confirmation>, DispatchError> {
        let backlog = self.ledger.unconfirmed_acknowledged(self.backlog_limit).await?;
        let targets = merge_targets(recent, backlog);
        if targets.is_empty() {
            debug!("no acknowledged records awaiting confirmation");
            return Ok(Vec::new());
        }
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let mut guard = BatchGuard::new("reconcile", threshold);
        let mut confirmations = Vec::with_capacity(targets.len());

        let transaction_ids: Vec<TransactionId> = targets
            .iter()
            .filter_map(|record| record.transaction_id().cloned())
            .collect();
        let mut answers = match self.channel.query_statuses(&transaction_ids, cancel).await {
            Ok(answers) => answers,
            Err(ChannelError::Cancelled) => return Err(DispatchError::Cancelled),
            Err(error) => {
                for record in &targets {
                    guard.record_failure(&record.id, &error);
                }
                guard.finish()?;
                return Ok(confirmations);
            }
        };

        for record in targets {
            let Some(transaction_id) = record.transaction_id() else {
                continue;
            };

            let now = Utc::now();
            let status = match answers.remove(transaction_id) {
                Some(Ok(partner_status)) => ConfirmationStatus::from_partner(
                    partner_status.status_code,
                    &partner_status.status_message,
                    now,
                ),
                Some(Err(ChannelError::NotFound(_))) | None => self.unlisted(&record, now),
                Some(Err(error)) => {
                    guard.record_failure(&record.id, &error);
                    continue;
                }
            };

            if let Err(error) = self.ledger.record_confirmation(&record, &status).await {
                guard.record_failure(&record.id, &error);
                continue;
            }
            guard.record_success();

            let labels = [("state", status.state.label())];
            metrics::counter!("epcis_confirmations_total", &labels).increment(1);

            match status.state {
                ConfirmationState::Confirmed => info!(
                    record_id = %record.id,
                    transaction_id = %transaction_id,
                    "partner confirmed delivery"
                ),
                ConfirmationState::Failed => warn!(
                    record_id = %record.id,
                    transaction_id = %transaction_id,
                    status_code = ?status.status_code,
                    "partner reported failed delivery: {}",
                    status.status_message
                ),
                ConfirmationState::Pending => debug!(
                    record_id = %record.id,
                    transaction_id = %transaction_id,
                    "delivery still pending: {}",
                    status.status_message
                ),
            }

            confirmations.push(Confirmation { record, status });
        }

        let summary = guard.finish()?;
        info!(
            checked = summary.attempted,
            updated = summary.succeeded,
            "reconciled partner confirmations"
        );
        Ok(confirmations)
    }
}
