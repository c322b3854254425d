use std::sync::Arc;
use std::time::Instant;

use chrono::Duration;
use epcis_common::dispatch::ConfirmationState;
use epcis_common::store::DocumentStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::alerts::notify_on_errors;
use crate::document::{extract_documents, DocumentSource};
use crate::error::DispatchError;
use crate::executor::DispatchExecutor;
use crate::ledger::{DispatchLedger, Transition};
use crate::partner::{StatusChannel, SubmissionChannel};
use crate::reconciler::ConfirmationReconciler;
use crate::selector::{CandidateSelector, DispatchSettings};

/// Counts of one completed cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub selected: usize,
    pub prepared: usize,
    pub acknowledged: usize,
    pub retrying: usize,
    pub failed: usize,
    pub confirmed: usize,
    pub rejected_by_partner: usize,
    pub awaiting_confirmation: usize,
    pub alerts: usize,
}

/// Collections the pipeline reads and writes.
#[derive(Debug, Clone)]
pub struct Collections {
    pub shipping: String,
    pub dispatch: String,
}

/// One pass over the ledger: select, extract documents, dispatch, reconcile, notify.
pub struct DispatchPipeline {
    ledger: Arc<DispatchLedger>,
    selector: CandidateSelector,
    documents: Arc<dyn DocumentSource>,
    executor: DispatchExecutor,
    reconciler: ConfirmationReconciler,
    settings: DispatchSettings,
}

impl DispatchPipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collections: &Collections,
        documents: Arc<dyn DocumentSource>,
        submission: Arc<dyn SubmissionChannel>,
        status: Arc<dyn StatusChannel>,
        settings: DispatchSettings,
    ) -> Self {
        let ledger = Arc::new(DispatchLedger::new(store.clone(), &collections.dispatch));

        Self {
            selector: CandidateSelector::new(store, &collections.shipping, ledger.clone()),
            documents,
            executor: DispatchExecutor::new(ledger.clone(), submission),
            reconciler: ConfirmationReconciler::new(ledger.clone(), status)
                .with_confirmation_window(Duration::days(i64::from(
                    settings.confirmation_window_days,
                ))),
            ledger,
            settings,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub async fn run_cycle(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CycleSummary, DispatchError> {
        let started = Instant::now();
        let result = self.run_stages(cancel).await;

        let labels = [(
            "result",
            match &result {
                Ok(_) => "completed",
                Err(DispatchError::Cancelled) => "cancelled",
                Err(_) => "aborted",
            },
        )];
        metrics::histogram!("epcis_cycle_duration_seconds", &labels)
            .record(started.elapsed().as_secs_f64());

        result
    }

    async fn run_stages(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CycleSummary, DispatchError> {
        let settings = &self.settings;
        let mut summary = CycleSummary::default();

        let candidates = self.selector.select(settings, cancel).await?;
        summary.selected = candidates.len();

        let prepared = extract_documents(
            self.documents.as_ref(),
            &self.ledger,
            candidates,
            settings.failure_threshold,
            cancel,
        )
        .await?;
        summary.prepared = prepared.len();

        let results = self.executor.dispatch(prepared, settings, cancel).await?;
        for result in &results {
            match result.transition {
                Transition::Acknowledged { .. } => summary.acknowledged += 1,
                Transition::Retrying { .. } => summary.retrying += 1,
                Transition::Failed { .. } => summary.failed += 1,
            }
        }

        let confirmations = self
            .reconciler
            .reconcile(&results, settings.failure_threshold, cancel)
            .await?;
        for confirmation in &confirmations {
            match confirmation.status.state {
                ConfirmationState::Confirmed => summary.confirmed += 1,
                ConfirmationState::Failed => summary.rejected_by_partner += 1,
                ConfirmationState::Pending => summary.awaiting_confirmation += 1,
            }
        }

        let alerts = notify_on_errors(
            &self.ledger,
            &results,
            &confirmations,
            settings.max_attempts,
        )
        .await?;
        summary.alerts = alerts.total();

        info!(
            selected = summary.selected,
            acknowledged = summary.acknowledged,
            retrying = summary.retrying,
            failed = summary.failed,
            confirmed = summary.confirmed,
            alerts = summary.alerts,
            "dispatch cycle completed"
        );
        Ok(summary)
    }
}
