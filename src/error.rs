use std::path::PathBuf;

use thiserror::Error;

use crate::lock::LockMode;

/// Seconds a caller should wait before re-submitting a busy request.
pub const RETRY_AFTER_SECS: (u64, u64) = (1, 15);

/// Errors from the hashed lock registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The lock could not be taken within the caller's timeout
    #[error("Lock unavailable: {mode} lock on {key}")]
    Unavailable { key: String, mode: LockMode },
}

/// Reasons a scoped file guard could not be acquired
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    /// The input is held by a writer and the guard was told not to wait
    #[error("Input is busy: {0}")]
    InputBusy(PathBuf),

    /// Another writer holds the output
    #[error("Output is locked by another writer: {0}")]
    OutputBusy(PathBuf),

    /// The output already exists and the guard was told to fail on existing outputs
    #[error("Output already exists: {0}")]
    OutputExists(PathBuf),

    /// The exclusive advisory lock on the output could not be taken
    #[error("Could not lock output {path}: {message}")]
    OutputLockFailed { path: PathBuf, message: String },

    /// The shared advisory lock on the input was not granted before the backoff ran out
    #[error("Shared lock on {path} not granted after waiting {waited_ms}ms")]
    BackoffExhausted { path: PathBuf, waited_ms: u64 },

    /// The file could not be opened for locking
    #[error("I/O error on {path}: {message}")]
    Io { path: PathBuf, message: String },
}

impl GuardError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        GuardError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Typed failures of a conversion request.
///
/// `Busy` is the Future outcome: the resource is temporarily held and the
/// caller should re-submit later. Every other variant is fatal for the
/// current attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertError {
    /// Lock or resource temporarily unavailable (retry later)
    #[error("Resource busy, retry in {}-{}s: {reason}", RETRY_AFTER_SECS.0, RETRY_AFTER_SECS.1)]
    Busy { reason: GuardError },

    /// Converter binary missing or too old
    #[error("Converter not available: {reason}")]
    ConfigurationMissing { reason: String },

    /// The converter hit its internal time budget
    #[error("Converter timed out: {command}")]
    Timeout { command: String },

    /// The converter kept reporting a transient library error after a retry
    #[error("Converter library error (exit code {code}) persisted after retry")]
    TransientLibrary { code: i32 },

    /// Output was produced but is too small to be a valid image
    #[error("Corrupt output {path}: {size} bytes, minimum is {minimum}")]
    CorruptOutput {
        path: PathBuf,
        size: u64,
        minimum: u64,
    },

    /// The input format is not recognized or lacks what the operation needs
    #[error("Unsupported input: {reason}")]
    UnsupportedInput { reason: String },

    /// The converter exited with a non-zero, non-retryable code
    #[error("Converter failed with exit code {code}: {stderr}")]
    ConverterFailed { code: i32, stderr: String },

    /// The request parameters are malformed
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// File system error outside of locking
    #[error("I/O error on {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// A blocking worker task failed to complete
    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl ConvertError {
    /// Whether the caller should re-submit the same request later.
    pub fn is_retry_later(&self) -> bool {
        matches!(self, ConvertError::Busy { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        ConvertError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        ConvertError::InvalidRequest {
            reason: reason.into(),
        }
    }
}

impl From<GuardError> for ConvertError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Io { path, message } => ConvertError::Io { path, message },
            reason => ConvertError::Busy { reason },
        }
    }
}
