//! Error types for the tarn lake engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::JobStatus;

/// Result type alias using tarn's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for tarn operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// Archive not found
    #[error("Archive not found: {0}")]
    ArchiveNotFound(Uuid),

    /// Entry not found
    #[error("Entry not found: {0}")]
    EntryNotFound(Uuid),

    /// Job creation referenced a missing or already-terminal parent
    #[error("Invalid parent job: {0}")]
    InvalidParent(Uuid),

    /// Illegal job-status move (stale or out-of-order events land here)
    #[error("Invalid transition for job {job_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    /// Lineage closure violation on entry creation
    #[error("Lineage error: {0}")]
    Lineage(String),

    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Inference/generation failed
    #[error("Inference error: {0}")]
    Inference(String),

    /// Capability call exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Archive refused the query
    #[error("Archive error: {0}")]
    Archive(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Request(e.to_string())
        }
    }
}

/// Classified failure reason carried on a job record.
///
/// The kind decides the retry policy: transient kinds are retried up to the
/// job's `max_retries`, fatal kinds fail the job (and, transitively, its
/// ancestors) on first occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Archive backend temporarily unreachable.
    ArchiveUnavailable,
    /// Archive is in maintenance mode; back off and re-poll.
    ArchiveInMaintenance,
    /// A model capability call timed out.
    CapabilityTimeout,
    /// A model capability call failed for a presumably transient reason.
    CapabilityUnavailable,
    /// The query was malformed or unanswerable by the archive.
    InvalidQuery,
    /// Retrieval across all requested archives produced zero candidates.
    NoResultsFound,
    /// Compaction hit the stage ceiling without reducing to one entry.
    CompactionDidNotConverge,
    /// The response capability failed unrecoverably.
    ResponseGenerationFailed,
    /// A job-status move violated the state machine.
    InvalidTransition,
    /// A job was created against a missing or terminal parent.
    InvalidParent,
    /// Unexpected internal failure.
    Internal,
}

impl ErrorKind {
    /// Whether failures of this kind may be retried automatically.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::ArchiveUnavailable
                | ErrorKind::ArchiveInMaintenance
                | ErrorKind::CapabilityTimeout
                | ErrorKind::CapabilityUnavailable
        )
    }

    /// String tag used in job records and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ArchiveUnavailable => "archive_unavailable",
            ErrorKind::ArchiveInMaintenance => "archive_in_maintenance",
            ErrorKind::CapabilityTimeout => "capability_timeout",
            ErrorKind::CapabilityUnavailable => "capability_unavailable",
            ErrorKind::InvalidQuery => "invalid_query",
            ErrorKind::NoResultsFound => "no_results_found",
            ErrorKind::CompactionDidNotConverge => "compaction_did_not_converge",
            ErrorKind::ResponseGenerationFailed => "response_generation_failed",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::InvalidParent => "invalid_parent",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Structured error stored on a Failed job and surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether the owning job may be retried after this failure.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds_are_retryable() {
        assert!(ErrorKind::ArchiveUnavailable.is_retryable());
        assert!(ErrorKind::ArchiveInMaintenance.is_retryable());
        assert!(ErrorKind::CapabilityTimeout.is_retryable());
        assert!(ErrorKind::CapabilityUnavailable.is_retryable());
    }

    #[test]
    fn test_fatal_kinds_are_not_retryable() {
        assert!(!ErrorKind::InvalidQuery.is_retryable());
        assert!(!ErrorKind::NoResultsFound.is_retryable());
        assert!(!ErrorKind::CompactionDidNotConverge.is_retryable());
        assert!(!ErrorKind::ResponseGenerationFailed.is_retryable());
        assert!(!ErrorKind::InvalidTransition.is_retryable());
        assert!(!ErrorKind::InvalidParent.is_retryable());
        assert!(!ErrorKind::Internal.is_retryable());
    }

    #[test]
    fn test_job_error_display() {
        let err = JobError::new(ErrorKind::NoResultsFound, "0 candidates across 2 archives");
        assert_eq!(
            err.to_string(),
            "no_results_found: 0 candidates across 2 archives"
        );
    }

    #[test]
    fn test_job_error_round_trips_through_json() {
        let err = JobError::new(ErrorKind::ArchiveInMaintenance, "archive rebalancing");
        let json = serde_json::to_string(&err).unwrap();
        let back: JobError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
        assert!(json.contains("archive_in_maintenance"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_invalid_transition_display() {
        let id = Uuid::nil();
        let err = Error::InvalidTransition {
            job_id: id,
            from: JobStatus::Succeeded,
            to: JobStatus::Running,
        };
        let msg = err.to_string();
        assert!(msg.contains("Succeeded"));
        assert!(msg.contains("Running"));
    }
}
