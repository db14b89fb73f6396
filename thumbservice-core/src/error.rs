use std::time::Duration;

use thiserror::Error;

use crate::filter::FilterRejection;

/// Failure talking to the repository. Never fatal; the scheduler retries on
/// the next tick or moves on to the next event.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("`{command}` exited with {}: {stderr}", exit_label(.exit_code))]
    Command {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("revision {path}#{revision} is no longer current")]
    StaleRevision { path: String, revision: u32 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unexpected repository output: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    /// Whether the error means the session itself is gone, as opposed to a
    /// single request failing.
    pub fn is_connection(&self) -> bool {
        matches!(self, AdapterError::Connection(_))
    }
}

/// Failure of the external conversion step for one event.
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("conversion timed out after {0:?}")]
    Timeout(Duration),

    #[error("converter exited with {}: {stderr}", exit_label(.exit_code))]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("conversion cancelled by shutdown")]
    Cancelled,
}

#[derive(Error, Debug)]
#[error("attribute write failed: {source}")]
pub struct AttributeWriteError {
    #[from]
    pub source: AdapterError,
}

/// Why a change event did not produce a digest.
#[derive(Error, Debug)]
pub enum ThumbnailFailure {
    #[error("{0}")]
    Rejected(FilterRejection),

    #[error("fetch failed: {0}")]
    Fetch(AdapterError),

    #[error("{0}")]
    Conversion(ConversionError),

    #[error("{0}")]
    Write(AttributeWriteError),
}

/// Coarse classification of a [`ThumbnailFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    Oversize,
    UnsupportedType,
    AlreadyPresent,
    ConversionError,
    AdapterError,
}

impl ThumbnailFailure {
    pub fn cause(&self) -> FailureCause {
        match self {
            ThumbnailFailure::Rejected(FilterRejection::TooLarge { .. }) => {
                FailureCause::Oversize
            }
            ThumbnailFailure::Rejected(
                FilterRejection::UnsupportedType { .. },
            ) => FailureCause::UnsupportedType,
            ThumbnailFailure::Rejected(
                FilterRejection::ThumbnailPresent { .. },
            ) => FailureCause::AlreadyPresent,
            ThumbnailFailure::Conversion(_) => FailureCause::ConversionError,
            ThumbnailFailure::Fetch(_) | ThumbnailFailure::Write(_) => {
                FailureCause::AdapterError
            }
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}
