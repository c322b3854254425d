use epcis_common::batch::BatchAborted;
use epcis_common::dispatch::RecordError;
use epcis_common::store::StoreError;
use http::StatusCode;
use thiserror::Error;

/// Errors from the partner submission and status channels.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("partner rejected the request with {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("partner is unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },
    #[error("request to partner failed: {0}")]
    Transport(reqwest::Error),
    #[error("request to partner timed out")]
    Timeout,
    #[error("request to partner was cancelled")]
    Cancelled,
    #[error("could not decode partner response: {0}")]
    Decode(String),
    #[error("partner has no status for transaction {0}")]
    NotFound(String),
    #[error("partner client is misconfigured: {0}")]
    Configuration(String),
}

impl ChannelError {
    /// Classify an HTTP error response. 429 is throttling and gets retried like any 5XX.
    pub fn from_status(status: StatusCode, message: String) -> Self {
        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            ChannelError::Rejected {
                status: status.as_u16(),
                message,
            }
        } else {
            ChannelError::Unavailable {
                status: status.as_u16(),
                message,
            }
        }
    }

    /// Whether retrying the same request could never succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            ChannelError::Rejected { .. } | ChannelError::Configuration(_) => true,
            ChannelError::Unavailable { .. }
            | ChannelError::Transport(_)
            | ChannelError::Timeout
            | ChannelError::Cancelled
            | ChannelError::Decode(_)
            | ChannelError::NotFound(_) => false,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ChannelError::Rejected { status, .. } | ChannelError::Unavailable { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ChannelError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ChannelError::Timeout
        } else {
            ChannelError::Transport(error)
        }
    }
}

/// Errors that stop a pipeline stage.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("record store error: {0}")]
    Store(#[from] StoreError),
    #[error("partner channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("invalid record: {0}")]
    InvalidRecord(#[from] RecordError),
    #[error("record {0} is already acknowledged")]
    AlreadyAcknowledged(String),
    #[error(transparent)]
    BatchThreshold(#[from] BatchAborted),
    #[error("dispatch cycle was cancelled")]
    Cancelled,
}
