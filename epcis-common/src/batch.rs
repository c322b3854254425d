//! Failure-rate guard shared by every batch stage.
//!
//! A stage records the outcome of each item it attempts. Item failures are logged and
//! dropped from the result, and the stage carries on with the successful subset, unless
//! the share of failures exceeds the configured threshold, in which case the whole
//! stage is aborted.
use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::{error, warn};

/// Maximum tolerated share of failed items in a batch, between 0.0 and 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailureThreshold(f64);

#[derive(Error, Debug, PartialEq)]
#[error("failure threshold must be a number between 0.0 and 1.0, got {0}")]
pub struct InvalidThresholdError(pub String);

impl FailureThreshold {
    pub fn new(value: f64) -> Result<Self, InvalidThresholdError> {
        if (0.0..=1.0).contains(&value) {
            Ok(FailureThreshold(value))
        } else {
            Err(InvalidThresholdError(value.to_string()))
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl Default for FailureThreshold {
    fn default() -> Self {
        FailureThreshold(0.5)
    }
}

impl FromStr for FailureThreshold {
    type Err = InvalidThresholdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .trim()
            .parse::<f64>()
            .map_err(|_| InvalidThresholdError(s.to_owned()))?;
        FailureThreshold::new(value)
    }
}

impl fmt::Display for FailureThreshold {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raised when a stage's failure rate is above its threshold.
#[derive(Error, Debug, Clone, PartialEq)]
#[error(
    "{stage}: {failed} of {attempted} items failed, failure rate {:.1}% exceeds threshold {:.1}%",
    .rate * 100.0,
    .threshold * 100.0
)]
pub struct BatchAborted {
    pub stage: String,
    pub attempted: usize,
    pub failed: usize,
    pub rate: f64,
    pub threshold: f64,
}

/// Counts of a stage that stayed within its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct BatchGuard {
    stage: &'static str,
    threshold: FailureThreshold,
    attempted: usize,
    failed: usize,
}

impl BatchGuard {
    pub fn new(stage: &'static str, threshold: FailureThreshold) -> Self {
        Self {
            stage,
            threshold,
            attempted: 0,
            failed: 0,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn record_success(&mut self) {
        self.attempted += 1;
    }

    /// Count a failed item and log why it was excluded.
    pub fn record_failure(&mut self, item: &dyn fmt::Display, error: &dyn fmt::Display) {
        self.attempted += 1;
        self.failed += 1;
        warn!(
            stage = self.stage,
            item = %item,
            "excluding item from batch: {}",
            error
        );
    }

    pub fn failure_rate(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            self.failed as f64 / self.attempted as f64
        }
    }

    /// Close the stage. An empty batch never aborts.
    pub fn finish(self) -> Result<BatchSummary, BatchAborted> {
        let rate = self.failure_rate();

        if rate > self.threshold.value() {
            let aborted = BatchAborted {
                stage: self.stage.to_owned(),
                attempted: self.attempted,
                failed: self.failed,
                rate,
                threshold: self.threshold.value(),
            };
            error!("aborting batch: {}", aborted);
            metrics::counter!("epcis_batch_aborts_total", &[("stage", self.stage)]).increment(1);
            return Err(aborted);
        }

        Ok(BatchSummary {
            attempted: self.attempted,
            succeeded: self.attempted - self.failed,
            failed: self.failed,
        })
    }
}

/// Run `check` over `items` under a guard, keeping the items that pass.
pub fn filter_batch<T, E, F>(
    stage: &'static str,
    threshold: FailureThreshold,
    items: Vec<T>,
    mut check: F,
) -> Result<Vec<T>, BatchAborted>
where
    T: fmt::Display,
    E: fmt::Display,
    F: FnMut(&T) -> Result<(), E>,
{
    let mut guard = BatchGuard::new(stage, threshold);
    let mut kept = Vec::with_capacity(items.len());

    for item in items {
        match check(&item) {
            Ok(()) => {
                guard.record_success();
                kept.push(item);
            }
            Err(error) => guard.record_failure(&item, &error),
        }
    }

    guard.finish()?;
    Ok(kept)
}
