use crate::{TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use thiserror::Error;

/// Failure category recorded on a task, coarse enough for a client to decide
/// whether submitting the same request again makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    SourceUnavailable,
    SourceProtected,
    TransferError,
    PostprocessError,
    Cancelled,
    CapacityExceeded,
    TimedOut,
    LimitExceeded,
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransferError | ErrorKind::TimedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::SourceUnavailable => "source_unavailable",
            ErrorKind::SourceProtected => "source_protected",
            ErrorKind::TransferError => "transfer_error",
            ErrorKind::PostprocessError => "postprocess_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::LimitExceeded => "limit_exceeded",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("Source is protected: {0}")]
    SourceProtected(String),
    #[error("Transfer failed: {0}")]
    Transfer(String),
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Post-processing failed: {0}")]
    Postprocess(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Download was cancelled")]
    Cancelled,
    #[error("Download timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("Download queue is full ({limit} tasks waiting)")]
    CapacityExceeded { limit: usize },
    #[error("Task {0} not found")]
    NotFound(TaskId),
    #[error("Task {id} is {status}")]
    WrongState { id: TaskId, status: TaskStatus },
    #[error("Download queue has been shut down")]
    ManagerShutdown,
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::InvalidRequest(_)
            | TaskError::NotFound(_)
            | TaskError::WrongState { .. } => ErrorKind::InvalidRequest,
            TaskError::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            TaskError::SourceProtected(_) => ErrorKind::SourceProtected,
            TaskError::Transfer(_) | TaskError::Network(_) => ErrorKind::TransferError,
            TaskError::Postprocess(_) => ErrorKind::PostprocessError,
            TaskError::Cancelled => ErrorKind::Cancelled,
            TaskError::TimedOut(_) => ErrorKind::TimedOut,
            TaskError::LimitExceeded(_) => ErrorKind::LimitExceeded,
            TaskError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            TaskError::Io(_) | TaskError::ManagerShutdown => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Rejections raised by the [TaskStore](crate::TaskStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Task {0} not found")]
    NotFound(TaskId),
    #[error("Task {id} already {status}")]
    Finished { id: TaskId, status: TaskStatus },
    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
}

impl From<StoreError> for TaskError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => TaskError::NotFound(id),
            StoreError::Finished { id, status }
            | StoreError::InvalidTransition { id, from: status, .. } => {
                TaskError::WrongState { id, status }
            }
        }
    }
}

const PROTECTED: &[&str] = &["drm", "widevine", "playready", "sabr", "unplayable", "copyright"];
const UNAVAILABLE: &[&str] = &[
    "private video",
    "video is private",
    "video unavailable",
    "has been removed",
    "not available in your country",
    "unavailable in your region",
    "geo restricted",
    "geo-restricted",
    "age-restricted",
    "confirm your age",
    "sign in to confirm",
    "is live",
    "live event",
    "live stream",
    "requested format is not available",
    "no video formats",
    "http error 404",
    "http error 410",
];
const INVALID: &[&str] = &["unsupported url", "invalid url", "is not a valid url", "no video id"];

/// Map a diagnostic emitted by an extraction tool onto the error taxonomy.
///
/// Unrecognised messages are treated as transfer errors so the client may
/// retry them.
pub fn classify(message: &str) -> TaskError {
    let lower = message.to_lowercase();
    let detail = summarize(message);
    let matches = |keywords: &[&str]| keywords.iter().any(|kw| lower.contains(kw));

    if matches(PROTECTED) {
        TaskError::SourceProtected(detail)
    } else if matches(UNAVAILABLE) {
        TaskError::SourceUnavailable(detail)
    } else if matches(INVALID) {
        TaskError::InvalidRequest(detail)
    } else {
        TaskError::Transfer(detail)
    }
}

fn summarize(message: &str) -> String {
    let line = message
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("unknown error");
    let line = line.strip_prefix("ERROR:").map(str::trim).unwrap_or(line);
    line.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_protected_content() {
        let err = classify("ERROR: [youtube] abc: This video is DRM protected");
        assert_eq!(err.kind(), ErrorKind::SourceProtected);
        assert!(!err.is_retryable());
    }

    #[test]
    fn classifies_unavailable_content() {
        for msg in [
            "ERROR: [youtube] abc: Private video. Sign in if you've been granted access",
            "ERROR: [youtube] abc: Video unavailable",
            "ERROR: The uploader has not made this video available in your country",
            "ERROR: Sign in to confirm your age",
            "ERROR: Requested format is not available",
        ] {
            assert_eq!(classify(msg).kind(), ErrorKind::SourceUnavailable, "{msg}");
        }
    }

    #[test]
    fn unknown_messages_are_retryable_transfer_errors() {
        let err = classify("ERROR: Unable to download webpage: Connection reset by peer");
        assert_eq!(err.kind(), ErrorKind::TransferError);
        assert!(err.is_retryable());
    }

    #[test]
    fn classify_keeps_last_meaningful_line() {
        let err = classify("WARNING: something\nERROR: Unsupported URL: https://example.com\n\n");
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(err.to_string(), "Invalid request: Unsupported URL: https://example.com");
    }

    #[test]
    fn store_errors_convert_to_task_errors() {
        let err: TaskError = StoreError::NotFound(7).into();
        assert!(matches!(err, TaskError::NotFound(7)));

        let err: TaskError = StoreError::Finished {
            id: 3,
            status: TaskStatus::Completed,
        }
        .into();
        assert_eq!(err.to_string(), "Task 3 is completed");
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::SourceProtected).unwrap();
        assert_eq!(json, "\"source_protected\"");
        assert_eq!(ErrorKind::TimedOut.to_string(), "timed_out");
    }
}
