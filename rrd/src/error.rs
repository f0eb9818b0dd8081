//! Error types for the rrd point store.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// The main error type for all rrd operations.
///
/// The variants follow the failure taxonomy of the store: a caller's context
/// was already done, the backing store could not be reached at all, or an
/// individual backing-store operation failed.
#[derive(Error, Debug)]
pub enum RrdError {
    /// The caller's context was cancelled or its deadline passed before the
    /// operation started.
    #[error("{operation} aborted: {reason}")]
    Cancelled {
        /// The operation that was refused.
        operation: &'static str,
        /// Why the context is done.
        reason: CancelReason,
    },

    /// The backing store could not be reached or set up.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] UnavailableError),

    /// A backing-store operation failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Configuration was rejected.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl RrdError {
    /// Returns true if the error is [`RrdError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns true if the error is [`RrdError::BackendUnavailable`].
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}

/// Why a [`Context`](crate::context::Context) stopped accepting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `cancel()` was called on the context or one of its parents.
    Cancelled,
    /// The context deadline has passed.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("context cancelled"),
            Self::DeadlineExceeded => f.write_str("context deadline exceeded"),
        }
    }
}

/// Errors raised when the backing store cannot be reached.
#[derive(Error, Debug)]
pub enum UnavailableError {
    /// The backend has been closed.
    #[error("backend is closed")]
    Closed,

    /// The backend could not be opened.
    #[error("failed to open backend at '{}': {source}", path.display())]
    Open {
        /// The location that could not be opened.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by individual backing-store operations.
#[derive(Error, Debug)]
pub enum BackendError {
    /// An I/O operation on a backend file failed.
    #[error("{operation} failed on '{}': {source}", path.display())]
    Io {
        /// The backend operation in progress.
        operation: &'static str,
        /// The file involved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A backend file has an invalid format.
    #[error("'{}' is corrupted: {reason}", path.display())]
    Corrupted {
        /// The corrupted file.
        path: PathBuf,
        /// Description of the corruption.
        reason: String,
    },

    /// A stored entry could not be decoded into a record.
    #[error("failed to decode {field} of entry returned by {operation}: {reason}")]
    Decode {
        /// The operation that returned the entry.
        operation: &'static str,
        /// The bin that was missing or mistyped.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// The bins handed to `put` cannot be stored in the target set.
    #[error("cannot store key {key} in set '{set}': {reason}")]
    UnsupportedBins {
        /// The target set.
        set: &'static str,
        /// The key being written.
        key: i64,
        /// Why the bins were rejected.
        reason: String,
    },

    /// A scan filter was rejected.
    #[error("invalid filter on bin '{bin}' [{min}, {max}]: {reason}")]
    Filter {
        /// The filtered bin.
        bin: String,
        /// Lower bound.
        min: i64,
        /// Upper bound.
        max: i64,
        /// Why the filter is invalid.
        reason: String,
    },

    /// A server-side reduction failed.
    #[error("reduction '{name}' failed: {reason}")]
    Reduction {
        /// Name of the reduction.
        name: String,
        /// Why it failed.
        reason: String,
    },

    /// Failed to (de)serialize a JSON-backed set.
    #[error("failed to {operation} '{}': {source}", path.display())]
    Json {
        /// `load` or `save`.
        operation: &'static str,
        /// The file involved.
        path: PathBuf,
        /// The underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// A task running a backend operation panicked or was aborted.
    #[error("{operation} task failed: {source}")]
    Task {
        /// The operation the task was running.
        operation: &'static str,
        /// The join failure.
        #[source]
        source: tokio::task::JoinError,
    },

    /// An internal lock was poisoned by a panicking thread.
    #[error("backend lock poisoned during {operation}")]
    Poisoned {
        /// The operation that observed the poisoned lock.
        operation: &'static str,
    },
}

/// Errors raised while validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// `max_records` must be at least one.
    #[error("invalid max_records: {value} (must be > 0)")]
    InvalidMaxRecords {
        /// The rejected value.
        value: u64,
    },
}

/// Type alias for `Result<T, RrdError>`.
pub type Result<T> = std::result::Result<T, RrdError>;
