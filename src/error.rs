//! Error taxonomy for a sync run.
//!
//! Per-entry errors (`DecodeError`, non-fatal `ReconcileError`) are counted
//! and the run continues. Everything that ends a run is folded into a
//! single `SyncError`.

use crate::feed::types::Encoding;
use thiserror::Error;

/// A raw entry that could not become a `Plugin`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("missing_required_field: {field}")]
    MissingRequiredField { field: &'static str },

    #[error("invalid_field: {field}: {detail}")]
    InvalidField { field: String, detail: String },

    #[error("malformed_entry ({encoding}): {detail}")]
    MalformedEntry { encoding: Encoding, detail: String },
}

impl DecodeError {
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::MissingRequiredField { .. } => "missing_required_field",
            DecodeError::InvalidField { .. } => "invalid_field",
            DecodeError::MalformedEntry { .. } => "malformed_entry",
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            DecodeError::MissingRequiredField { field } => Some(field),
            DecodeError::InvalidField { field, .. } => Some(field),
            DecodeError::MalformedEntry { .. } => None,
        }
    }
}

/// Failure to obtain a feed page.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    #[error("feed returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("page request timed out")]
    Timeout,

    #[error("malformed feed page: {0}")]
    Malformed(String),

    #[error("giving up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<FetchError> },

    #[error("pagination cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Timeouts, connection failures, 5xx and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport { retryable, .. } => *retryable,
            FetchError::Status { status, .. } => *status >= 500 || *status == 429,
            FetchError::Timeout => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if e.is_connect() || e.is_request() || e.is_body() {
            FetchError::transport_retryable(format!("{:#}", e))
        } else if e.is_decode() {
            FetchError::Malformed(e.to_string())
        } else {
            FetchError::transport_fatal(format!("{:#}", e))
        }
    }
}

/// Failure reported by a `PluginStore`.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The write for this key lost a race or violated a constraint.
    #[error("write conflict on {script_id}: {message}")]
    Conflict { script_id: String, message: String },

    /// The document could not be (de)serialized.
    #[error("document error: {0}")]
    Document(String),

    /// The store as a whole cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failure applying one entity.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("rejected {script_id}: {source}")]
    Rejected {
        script_id: String,
        #[source]
        source: StoreError,
    },

    #[error("store unavailable while applying {script_id}: {message}")]
    StoreUnavailable { script_id: String, message: String },
}

impl ReconcileError {
    pub fn from_store(script_id: &str, err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(message) => ReconcileError::StoreUnavailable {
                script_id: script_id.to_string(),
                message,
            },
            other => ReconcileError::Rejected {
                script_id: script_id.to_string(),
                source: other,
            },
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ReconcileError::StoreUnavailable { .. })
    }
}

/// Invalid invocation, detected before any network or store activity.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UsageError {
    #[error("since date {since} is in the future (today is {today})")]
    FutureSinceDate {
        since: chrono::NaiveDate,
        today: chrono::NaiveDate,
    },

    #[error("the store holds no plugins with a modification date; run a full sync first")]
    NoWatermark,
}

/// The terminal error of a failed run.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error("sync cancelled")]
    Cancelled,

    #[error("rejected {rejected} entities, more than the allowed {limit}")]
    TooManyRejections { rejected: u64, limit: u64 },

    #[error("a sync run is already in progress")]
    AlreadyRunning,

    #[error("internal error: {0}")]
    Internal(String),
}
