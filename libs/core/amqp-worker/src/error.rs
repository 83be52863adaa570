//! Worker error types and error categorization
//!
//! Per-message failures (decode, mapping, sink) are converted into a reject
//! decision by the pipeline. Connection-level failures go to the reconnection
//! state machine. The category decides requeue under
//! [`RejectPolicy::RequeueTransient`](crate::RejectPolicy::RequeueTransient):
//! - **Transient**: the same message may succeed later (backend unreachable)
//! - **Permanent**: retrying the same bytes cannot succeed (bad JSON, missing field, validation)

use thiserror::Error;

/// Category of error for deciding whether a rejected message is requeued
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Permanent,
}

/// Failure reported by a sink while persisting one event
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Required projected field missing or of the wrong type
    #[error("mapping error: {0}")]
    Mapping(String),

    /// Backend could not be reached (network, timeout, 5xx)
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    /// Backend refused the write (validation, auth, 4xx). Carries the backend's reason.
    #[error("sink rejected write: {0}")]
    Rejected(String),
}

impl SinkError {
    pub fn mapping(message: impl Into<String>) -> Self {
        SinkError::Mapping(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        SinkError::Unavailable(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        SinkError::Rejected(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            SinkError::Unavailable(_) => ErrorCategory::Transient,
            SinkError::Mapping(_) | SinkError::Rejected(_) => ErrorCategory::Permanent,
        }
    }
}

/// Worker errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Broker unreachable or the session broke during setup
    #[error("connection error: {0}")]
    Connection(String),

    /// Expected exchange absent or a declaration was refused
    #[error("topology error: {0}")]
    Topology(String),

    /// Payload is not UTF-8 text or not JSON
    #[error("decode error: {0}")]
    Decode(String),

    /// Sink failure, including mapping failures
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// Bounded reconnection gave up
    #[error("could not connect after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Shutdown requested while waiting
    #[error("shutdown requested")]
    Shutdown,
}

impl WorkerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            WorkerError::Connection(_) => ErrorCategory::Transient,
            WorkerError::Sink(e) => e.category(),
            WorkerError::Topology(_)
            | WorkerError::Decode(_)
            | WorkerError::ReconnectExhausted { .. }
            | WorkerError::Config(_)
            | WorkerError::Shutdown => ErrorCategory::Permanent,
        }
    }

    /// Short label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::Connection(_) => "connection",
            WorkerError::Topology(_) => "topology",
            WorkerError::Decode(_) => "decode",
            WorkerError::Sink(SinkError::Mapping(_)) => "mapping",
            WorkerError::Sink(_) => "sink",
            WorkerError::ReconnectExhausted { .. } => "reconnect_exhausted",
            WorkerError::Config(_) => "config",
            WorkerError::Shutdown => "shutdown",
        }
    }

    /// Errors that end the process rather than a single message
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkerError::Topology(_) | WorkerError::ReconnectExhausted { .. } | WorkerError::Config(_)
        )
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        WorkerError::Decode(err.to_string())
    }
}
