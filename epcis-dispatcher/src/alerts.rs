//! Operator notification for dispatches that need a human. Logging is the channel.
use epcis_common::dispatch::{ConfirmationState, DispatchRecord};
use tracing::error;

use crate::error::DispatchError;
use crate::executor::DispatchResult;
use crate::ledger::DispatchLedger;
use crate::reconciler::Confirmation;

const EXHAUSTED_SCAN_LIMIT: usize = 100;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AlertSummary {
    pub failed_now: usize,
    pub exhausted: usize,
    pub rejected_by_partner: usize,
}

impl AlertSummary {
    pub fn total(&self) -> usize {
        self.failed_now + self.exhausted + self.rejected_by_partner
    }
}

fn alert(kind: &'static str, record: &DispatchRecord, detail: &str) {
    let labels = [("kind", kind)];
    metrics::counter!("epcis_alerts_total", &labels).increment(1);
    error!(
        kind,
        record_id = %record.id,
        shipping_operation_id = %record.shipping_operation_id,
        capture_id = record.capture_id.as_deref().unwrap_or_default(),
        attempt_count = record.attempt_count,
        "dispatch needs attention: {}",
        detail
    );
}

/// Raise an alert for each permanent failure of this cycle, each record stuck in
/// `Failed` with no attempts left, and each delivery the partner reported as failed.
/// Records failing this cycle are not repeated in the exhausted list.
pub async fn notify_on_errors(
    ledger: &DispatchLedger,
    results: &[DispatchResult],
    confirmations: &[Confirmation],
    max_attempts: u32,
) -> Result<AlertSummary, DispatchError> {
    let mut summary = AlertSummary::default();

    let failed_now: Vec<&DispatchResult> = results
        .iter()
        .filter(|result| result.is_permanent_failure())
        .collect();
    for result in &failed_now {
        let detail = result.record.last_error.as_deref().unwrap_or("no error detail");
        alert("dispatch_failed", &result.record, detail);
        summary.failed_now += 1;
    }

    for record in ledger
        .exhausted_failures(max_attempts, EXHAUSTED_SCAN_LIMIT)
        .await?
    {
        if failed_now.iter().any(|result| result.record.id == record.id) {
            continue;
        }
        let detail = record.last_error.as_deref().unwrap_or("no error detail");
        alert("attempts_exhausted", &record, detail);
        summary.exhausted += 1;
    }

    for confirmation in confirmations
        .iter()
        .filter(|c| c.status.state == ConfirmationState::Failed)
    {
        alert(
            "partner_rejected",
            &confirmation.record,
            &confirmation.status.status_message,
        );
        summary.rejected_by_partner += 1;
    }

    Ok(summary)
}
