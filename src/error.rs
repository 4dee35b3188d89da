use std::time::Duration;

use thiserror::Error;

use crate::record::TimeoutId;

/// Errors surfaced by the timeout store and the poller.
#[derive(Debug, Error)]
pub enum TimeoutError {
    /// The backing store cannot be reached or refused the operation.
    #[error("timeout storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The record handed to `add` (or read back from storage) is invalid.
    #[error("malformed timeout record: {0}")]
    MalformedRecord(String),

    /// The dispatch callback reported failure for a record.
    #[error("dispatch of timeout {id} failed: {source}")]
    DispatchFailed {
        id: TimeoutId,
        #[source]
        source: DispatchError,
    },

    /// The dispatch callback did not finish within the configured bound.
    #[error("dispatch of timeout {id} timed out after {elapsed:?}")]
    DispatchTimedOut { id: TimeoutId, elapsed: Duration },

    /// Invalid configuration detected at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The poller behind a handle has stopped.
    #[error("timeout poller has shut down")]
    Shutdown,
}

/// Failure reported by a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct DispatchError {
    reason: String,
}

impl DispatchError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

pub type Result<T> = std::result::Result<T, TimeoutError>;

impl From<rusqlite::Error> for TimeoutError {
    fn from(e: rusqlite::Error) -> Self {
        TimeoutError::StorageUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for TimeoutError {
    fn from(e: serde_json::Error) -> Self {
        TimeoutError::MalformedRecord(e.to_string())
    }
}

impl From<tokio::task::JoinError> for TimeoutError {
    fn from(e: tokio::task::JoinError) -> Self {
        TimeoutError::StorageUnavailable(format!("storage task failed: {e}"))
    }
}
