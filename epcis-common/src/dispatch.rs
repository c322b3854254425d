//! Dispatch ledger types shared by the pipelines.
//!
//! A `DispatchRecord` is the persisted delivery state of one shipping operation
//! towards the partner network. The store keeps statuses as plain strings, here
//! they become closed enums so every transition site matches exhaustively and an
//! acknowledged record always carries its partner transaction id.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de::Visitor, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::store::Fields;
use crate::timestamp::parse_timestamp;

/// Field names of a dispatch record in the document store.
pub mod fields {
    pub const ID: &str = "id";
    pub const SHIPPING_OPERATION_ID: &str = "shipping_operation_id";
    pub const CAPTURE_ID: &str = "capture_id";
    pub const STATUS: &str = "status";
    pub const ATTEMPT_COUNT: &str = "dispatch_attempt_count";
    pub const TARGET_GLN: &str = "target_gln";
    pub const TRANSACTION_ID: &str = "partner_transaction_id";
    pub const HTTP_STATUS_CODE: &str = "http_status_code";
    pub const LAST_ERROR: &str = "last_error_message";
    pub const DATE_CREATED: &str = "date_created";
    pub const LAST_ATTEMPT: &str = "last_dispatch_attempt";
    pub const DATE_DISPATCHED: &str = "date_dispatched";
    pub const DATE_ACKNOWLEDGED: &str = "date_acknowledged";
    pub const PARTNER_STATUS: &str = "partner_status";
    pub const PARTNER_STATUS_MSG: &str = "partner_status_msg";
    pub const PARTNER_STATUS_UPDATED: &str = "partner_status_updated";
    pub const DATE_CONFIRMED: &str = "date_confirmed";
}

/// Identity of a record in the document store.
///
/// Collections hand out either numeric or string primary keys, and the same key may
/// come back as `7`, `7.0` or `"7"` depending on the endpoint. All of them normalise
/// to the same `RecordId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read an identity out of a JSON value. Nulls, empty strings and fractional
    /// numbers are not identities.
    pub fn from_value(value: &Value) -> Option<Self> {
        RecordId::deserialize(value).ok()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        RecordId(value.to_owned())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        RecordId(value)
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        RecordId(value.to_string())
    }
}

struct RecordIdVisitor;

impl<'de> Visitor<'de> for RecordIdVisitor {
    type Value = RecordId;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a non-empty string or an integral number")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        if s.is_empty() {
            return Err(E::invalid_value(serde::de::Unexpected::Str(s), &self));
        }
        Ok(RecordId(s.to_owned()))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(RecordId(v.to_string()))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(RecordId(v.to_string()))
    }

    fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        if !v.is_finite() || v.fract() != 0.0 {
            return Err(E::invalid_value(serde::de::Unexpected::Float(v), &self));
        }
        Ok(RecordId(format!("{v:.0}")))
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(RecordIdVisitor)
    }
}

/// Transaction id assigned by the partner on acknowledgement. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(TransactionId(trimmed.to_owned()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseStatusError {
    #[error("{0} is not a valid dispatch status")]
    Unknown(String),
    #[error("acknowledged record has no partner transaction id")]
    MissingTransactionId,
}

/// Lifecycle of a dispatch record. A shipping operation without a record is
/// represented by the absence of a `DispatchRecord` altogether.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchStatus {
    Pending,
    Processing,
    Acknowledged { transaction_id: TransactionId },
    Retrying,
    Failed,
}

impl DispatchStatus {
    /// The string persisted in the store.
    pub fn label(&self) -> &'static str {
        match self {
            DispatchStatus::Pending => "Pending",
            DispatchStatus::Processing => "Processing",
            DispatchStatus::Acknowledged { .. } => "Acknowledged",
            DispatchStatus::Retrying => "Retrying",
            DispatchStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            DispatchStatus::Acknowledged { .. } | DispatchStatus::Failed => true,
            DispatchStatus::Pending | DispatchStatus::Processing | DispatchStatus::Retrying => {
                false
            }
        }
    }

    pub fn transaction_id(&self) -> Option<&TransactionId> {
        match self {
            DispatchStatus::Acknowledged { transaction_id } => Some(transaction_id),
            _ => None,
        }
    }

    /// Rebuild a status from its stored label and transaction id. Labels are matched
    /// case-insensitively and the legacy `Sent` label reads as acknowledged.
    pub fn from_parts(
        label: &str,
        transaction_id: Option<&str>,
    ) -> Result<DispatchStatus, ParseStatusError> {
        match label.trim().to_ascii_lowercase().as_ref() {
            "pending" => Ok(DispatchStatus::Pending),
            "processing" => Ok(DispatchStatus::Processing),
            "retrying" => Ok(DispatchStatus::Retrying),
            "failed" => Ok(DispatchStatus::Failed),
            "acknowledged" | "sent" => {
                let transaction_id = transaction_id
                    .and_then(TransactionId::new)
                    .ok_or(ParseStatusError::MissingTransactionId)?;
                Ok(DispatchStatus::Acknowledged { transaction_id })
            }
            _ => Err(ParseStatusError::Unknown(label.to_owned())),
        }
    }
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Labels every acknowledged record may be stored under.
pub const ACKNOWLEDGED_LABELS: [&str; 2] = ["Acknowledged", "Sent"];

/// Partner-side delivery state of an acknowledged dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfirmationState {
    Pending,
    Confirmed,
    Failed,
}

impl ConfirmationState {
    pub fn label(&self) -> &'static str {
        match self {
            ConfirmationState::Pending => "pending",
            ConfirmationState::Confirmed => "confirmed",
            ConfirmationState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConfirmationState::Pending)
    }
}

impl FromStr for ConfirmationState {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_ref() {
            "pending" => Ok(ConfirmationState::Pending),
            "confirmed" => Ok(ConfirmationState::Confirmed),
            "failed" => Ok(ConfirmationState::Failed),
            invalid => Err(ParseStatusError::Unknown(invalid.to_owned())),
        }
    }
}

impl fmt::Display for ConfirmationState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Numeric status the partner dashboard reports for a completed delivery.
const PARTNER_STATUS_COMPLETE: i64 = 4;

/// Whole words in a status message that settle a delivery one way or the other.
const FAILURE_TERMS: &[&str] = &["failed", "failure", "rejected", "rejection", "error"];
const COMPLETION_TERMS: &[&str] = &["complete", "completed", "acknowledged", "delivered"];

/// Result of one partner status query. The delivered and permanent flags follow
/// from the state: confirmed is delivered and permanent, failed is permanent only.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationStatus {
    pub state: ConfirmationState,
    pub status_code: Option<i64>,
    pub status_message: String,
    pub checked_at: DateTime<Utc>,
}

impl ConfirmationStatus {
    /// Map the partner's status vocabulary onto a confirmation state.
    ///
    /// The code decides first: 4XX is a rejection, 5XX is a partner-side hiccup to be
    /// asked about again, and the dashboard's own "complete" status is a delivery.
    /// Any other code falls back to the words of the message, where a failure word
    /// outweighs a completion word. Nothing recognised means still pending.
    pub fn from_partner(
        status_code: Option<i64>,
        status_message: &str,
        checked_at: DateTime<Utc>,
    ) -> Self {
        let state = match status_code {
            Some(code) if (400..500).contains(&code) => ConfirmationState::Failed,
            Some(code) if code >= 500 => ConfirmationState::Pending,
            Some(PARTNER_STATUS_COMPLETE) => ConfirmationState::Confirmed,
            _ => state_from_message(status_message),
        };

        Self {
            state,
            status_code,
            status_message: status_message.to_owned(),
            checked_at,
        }
    }

    pub fn delivered(&self) -> bool {
        matches!(self.state, ConfirmationState::Confirmed)
    }

    pub fn permanent(&self) -> bool {
        self.state.is_terminal()
    }
}

fn state_from_message(message: &str) -> ConfirmationState {
    let message = message.to_ascii_lowercase();
    let has_term = |terms: &[&str]| {
        message
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|word| terms.contains(&word))
    };

    if has_term(FAILURE_TERMS) {
        ConfirmationState::Failed
    } else if has_term(COMPLETION_TERMS) {
        ConfirmationState::Confirmed
    } else {
        ConfirmationState::Pending
    }
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("record has no {0}")]
    MissingField(&'static str),
    #[error("record field {field} has an invalid value: {value}")]
    InvalidField { field: &'static str, value: String },
    #[error(transparent)]
    Status(#[from] ParseStatusError),
}

/// Snapshot of one dispatch ledger entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    pub id: RecordId,
    pub shipping_operation_id: RecordId,
    pub capture_id: Option<String>,
    pub status: DispatchStatus,
    pub attempt_count: u32,
    pub target_location: Option<String>,
    pub http_status_code: Option<u16>,
    pub last_error: Option<String>,
    pub partner_status: Option<ConfirmationState>,
    pub partner_status_message: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl DispatchRecord {
    /// Decode a record as returned by the document store.
    pub fn from_fields(record: &Fields) -> Result<Self, RecordError> {
        let id = record
            .get(fields::ID)
            .and_then(RecordId::from_value)
            .ok_or(RecordError::MissingField(fields::ID))?;
        let shipping_operation_id = record
            .get(fields::SHIPPING_OPERATION_ID)
            .and_then(RecordId::from_value)
            .ok_or(RecordError::MissingField(fields::SHIPPING_OPERATION_ID))?;

        let label = text(record, fields::STATUS).unwrap_or_else(|| "Pending".to_owned());
        let transaction_id = text(record, fields::TRANSACTION_ID);
        let status = DispatchStatus::from_parts(&label, transaction_id.as_deref())?;

        let attempt_count = match record.get(fields::ATTEMPT_COUNT) {
            None | Some(Value::Null) => 0,
            Some(value) => count(value).ok_or_else(|| RecordError::InvalidField {
                field: fields::ATTEMPT_COUNT,
                value: value.to_string(),
            })?,
        };

        let http_status_code = record
            .get(fields::HTTP_STATUS_CODE)
            .and_then(count)
            .and_then(|code| u16::try_from(code).ok());

        let partner_status = text(record, fields::PARTNER_STATUS).map(|label| {
            // Unknown partner labels are treated as not yet settled.
            label.parse().unwrap_or(ConfirmationState::Pending)
        });

        Ok(Self {
            id,
            shipping_operation_id,
            capture_id: text(record, fields::CAPTURE_ID),
            status,
            attempt_count,
            target_location: text(record, fields::TARGET_GLN),
            http_status_code,
            last_error: text(record, fields::LAST_ERROR),
            partner_status,
            partner_status_message: text(record, fields::PARTNER_STATUS_MSG),
            created_at: datetime(record, fields::DATE_CREATED),
            last_attempt_at: datetime(record, fields::LAST_ATTEMPT),
            dispatched_at: datetime(record, fields::DATE_DISPATCHED),
            acknowledged_at: datetime(record, fields::DATE_ACKNOWLEDGED),
            confirmed_at: datetime(record, fields::DATE_CONFIRMED),
        })
    }

    pub fn transaction_id(&self) -> Option<&TransactionId> {
        self.status.transaction_id()
    }

    /// Acknowledged by the partner but without a settled partner status yet.
    pub fn awaiting_confirmation(&self) -> bool {
        self.transaction_id().is_some()
            && !self
                .partner_status
                .map(|state| state.is_terminal())
                .unwrap_or(false)
    }
}

/// Non-empty text value. Numbers are rendered as text.
fn text(record: &Fields, field: &str) -> Option<String> {
    let value = record.get(field)?;
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
        Value::Number(n) => Some(
            RecordId::from_value(value).map_or_else(|| n.to_string(), |id| id.to_string()),
        ),
        _ => None,
    }
}

fn datetime(record: &Fields, field: &str) -> Option<DateTime<Utc>> {
    match record.get(field)? {
        Value::String(s) => parse_timestamp(s),
        _ => None,
    }
}

/// Counters may come back as numbers or numeric strings.
fn count(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn object(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    #[test]
    fn test_record_id_normalises_representations() {
        assert_eq!(RecordId::from_value(&json!(7)), Some(RecordId::from(7)));
        assert_eq!(RecordId::from_value(&json!(7.0)), Some(RecordId::from(7)));
        assert_eq!(RecordId::from_value(&json!("7")), Some(RecordId::from(7)));
        assert_eq!(
            RecordId::from_value(&json!("a1b2")),
            Some(RecordId::from("a1b2"))
        );

        assert_eq!(RecordId::from_value(&json!(7.5)), None);
        assert_eq!(RecordId::from_value(&json!("")), None);
        assert_eq!(RecordId::from_value(&Value::Null), None);
        assert_eq!(RecordId::from_value(&json!({"id": 1})), None);
    }

    #[test]
    fn test_status_labels() {
        let acknowledged = DispatchStatus::from_parts("acknowledged", Some("tx-1")).unwrap();
        assert_eq!(acknowledged.label(), "Acknowledged");
        assert_eq!(acknowledged.transaction_id().unwrap().as_str(), "tx-1");
        assert!(acknowledged.is_terminal());

        assert_eq!(
            DispatchStatus::from_parts("Sent", Some("tx-1")).unwrap(),
            acknowledged
        );
        assert_eq!(
            DispatchStatus::from_parts("RETRYING", None).unwrap(),
            DispatchStatus::Retrying
        );
        assert!(!DispatchStatus::Retrying.is_terminal());
        assert!(DispatchStatus::Failed.is_terminal());

        assert_eq!(
            DispatchStatus::from_parts("shipped", None),
            Err(ParseStatusError::Unknown("shipped".to_owned()))
        );
    }

    #[test]
    fn test_acknowledged_requires_transaction_id() {
        assert_eq!(
            DispatchStatus::from_parts("Acknowledged", None),
            Err(ParseStatusError::MissingTransactionId)
        );
        assert_eq!(
            DispatchStatus::from_parts("Acknowledged", Some("  ")),
            Err(ParseStatusError::MissingTransactionId)
        );
        assert!(TransactionId::new("").is_none());
    }

    #[test]
    fn test_confirmation_mapping() {
        let now = Utc::now();

        let confirmed = ConfirmationStatus::from_partner(Some(4), "Processing", now);
        assert_eq!(confirmed.state, ConfirmationState::Confirmed);
        assert!(confirmed.delivered() && confirmed.permanent());

        let confirmed = ConfirmationStatus::from_partner(None, "Transfer Complete", now);
        assert_eq!(confirmed.state, ConfirmationState::Confirmed);

        let acknowledged = ConfirmationStatus::from_partner(Some(200), "Acknowledged", now);
        assert_eq!(acknowledged.state, ConfirmationState::Confirmed);

        let failed = ConfirmationStatus::from_partner(Some(3), "Validation error", now);
        assert_eq!(failed.state, ConfirmationState::Failed);
        assert!(!failed.delivered());
        assert!(failed.permanent());

        let failed = ConfirmationStatus::from_partner(Some(0), "Error processing file", now);
        assert_eq!(failed.state, ConfirmationState::Failed);

        let rejected = ConfirmationStatus::from_partner(Some(422), "Unprocessable", now);
        assert_eq!(rejected.state, ConfirmationState::Failed);

        let pending = ConfirmationStatus::from_partner(Some(1), "Queued", now);
        assert_eq!(pending.state, ConfirmationState::Pending);
        assert!(!pending.delivered() && !pending.permanent());
        assert_eq!(pending.status_message, "Queued");
    }

    #[test]
    fn test_partner_server_errors_stay_pending() {
        let now = Utc::now();

        for (code, message) in [
            (500, "Internal Server Error"),
            (502, "Bad Gateway"),
            (503, "Service Unavailable"),
        ] {
            let status = ConfirmationStatus::from_partner(Some(code), message, now);
            assert_eq!(status.state, ConfirmationState::Pending, "{code} {message}");
            assert!(!status.permanent());
        }
    }

    #[test]
    fn test_status_words_match_whole_terms() {
        let now = Utc::now();

        let in_progress =
            ConfirmationStatus::from_partner(Some(2), "In Progress - no errors so far", now);
        assert_eq!(in_progress.state, ConfirmationState::Pending);

        let unknown = ConfirmationStatus::from_partner(Some(0), "Unknown", now);
        assert_eq!(unknown.state, ConfirmationState::Pending);

        let incomplete = ConfirmationStatus::from_partner(None, "Incomplete upload", now);
        assert_eq!(incomplete.state, ConfirmationState::Pending);

        let failed_to_complete =
            ConfirmationStatus::from_partner(None, "Failed to complete transfer", now);
        assert_eq!(failed_to_complete.state, ConfirmationState::Failed);
    }

    #[test]
    fn test_record_from_fields() {
        let record = DispatchRecord::from_fields(&object(json!({
            "id": 12,
            "shipping_operation_id": "34",
            "capture_id": "capture-1",
            "status": "Acknowledged",
            "dispatch_attempt_count": "2",
            "target_gln": "0300011111116",
            "partner_transaction_id": "b7c1",
            "http_status_code": 200,
            "date_acknowledged": "2024-03-01T12:30:00",
            "partner_status": "pending",
        })))
        .unwrap();

        assert_eq!(record.id, RecordId::from(12));
        assert_eq!(record.shipping_operation_id, RecordId::from(34));
        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.http_status_code, Some(200));
        assert_eq!(record.transaction_id().unwrap().as_str(), "b7c1");
        assert_eq!(
            record.acknowledged_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap())
        );
        assert_eq!(record.partner_status, Some(ConfirmationState::Pending));
        assert!(record.awaiting_confirmation());
    }

    #[test]
    fn test_record_from_fields_defaults_and_errors() {
        let record = DispatchRecord::from_fields(&object(json!({
            "id": "r1",
            "shipping_operation_id": 9,
        })))
        .unwrap();
        assert_eq!(record.status, DispatchStatus::Pending);
        assert_eq!(record.attempt_count, 0);
        assert!(!record.awaiting_confirmation());

        assert!(matches!(
            DispatchRecord::from_fields(&object(json!({"id": 1}))),
            Err(RecordError::MissingField(fields::SHIPPING_OPERATION_ID))
        ));
        assert!(matches!(
            DispatchRecord::from_fields(&object(json!({
                "id": 1,
                "shipping_operation_id": 2,
                "status": "Acknowledged",
            }))),
            Err(RecordError::Status(ParseStatusError::MissingTransactionId))
        ));
        assert!(matches!(
            DispatchRecord::from_fields(&object(json!({
                "id": 1,
                "shipping_operation_id": 2,
                "dispatch_attempt_count": "many",
            }))),
            Err(RecordError::InvalidField { .. })
        ));
    }
}
