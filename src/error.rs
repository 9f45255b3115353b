//! Error types for the operation pipeline
//!
//! Undo failures are kept apart from execution failures so callers never
//! confuse "operation failed" with "rollback failed".

use thiserror::Error;

use crate::types::OperationStatus;

/// Root error type for pipeline failures.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Feature extraction or scoring produced no category.
    #[error("classification failed: {0}")]
    Classification(String),

    /// One or more verification layers failed.
    #[error("verification failed: {}", .issues.join("; "))]
    Verification { issues: Vec<String> },

    /// Executor failed before producing a record.
    #[error("execution failed: {0}")]
    Execution(String),

    #[error(transparent)]
    Undo(#[from] UndoError),

    #[error(transparent)]
    Feedback(#[from] FeedbackError),

    #[error("ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),

    /// The ledger refused a status change, either because the edge is not
    /// in the lifecycle graph or because another worker moved first.
    #[error("operation {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: OperationStatus,
        to: OperationStatus,
    },

    #[error("operation not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Rollback failures.
#[derive(Error, Debug)]
pub enum UndoError {
    #[error("no operation {0}")]
    UnknownOperation(String),

    /// Nothing to roll back: no execution, no backup, or nothing to undo
    /// for this requester.
    #[error("no backup available for {0}")]
    NoBackup(String),

    #[error("undo for {0} was already consumed")]
    AlreadyConsumed(String),

    #[error("execution of {0} is not reversible")]
    NotReversible(String),

    /// An undo action failed while being replayed.
    #[error("undo replay failed: {0}")]
    Replay(String),
}

/// Malformed feedback payloads. Local to the feedback channel.
#[derive(Error, Debug)]
pub enum FeedbackError {
    #[error("rating must be between 1 and 5, got {0}")]
    InvalidRating(u8),

    #[error("correction is identical to the system classification")]
    EmptyCorrection,

    #[error("feedback references unknown operation {0}")]
    UnknownOperation(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
