//! Error types for the activity model and engine

use crate::{QualifiedName, QueueName};

/// Errors that can occur while defining or executing workflows
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Activity not found: {0}")]
    ActivityNotFound(String),

    #[error("Duplicate activity name: {0}")]
    DuplicateActivityName(QualifiedName),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Workflow queue not found: {0}")]
    QueueNotFound(QueueName),

    #[error("Workflow queue already exists: {0}")]
    QueueAlreadyExists(QueueName),

    #[error("Workflow queue is not enabled: {0}")]
    QueueNotEnabled(QueueName),

    #[error("Index {index} out of range for list of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error(
        "Conditioned activity group '{0}' went quiet: until condition is false and no child can run"
    )]
    CagQuiet(QualifiedName),

    #[error("State '{state}' already subscribes to queue '{queue}'")]
    StateAlreadySubscribesToThisEvent {
        state: QualifiedName,
        queue: QueueName,
    },

    #[error("State not found: {0}")]
    StateNotFound(QualifiedName),

    #[error("Invalid target state: {0}")]
    InvalidTargetState(QualifiedName),

    #[error("Activity '{0}' is not inside a state machine")]
    NotInStateMachine(QualifiedName),

    #[error("Activity '{activity}' faulted: {message}")]
    ActivityFaulted {
        activity: QualifiedName,
        message: String,
    },

    #[error("Work item limit of {0} exceeded in a single run")]
    WorkLimitExceeded(usize),

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("Workflow validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;
