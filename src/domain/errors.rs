//! Domain errors for the foreman scheduler core.

use thiserror::Error;

use crate::domain::models::{TaskId, TaskStatus};

/// Domain-level errors. Recoverable variants become planned actions or
/// logged rejections; they never unwind the scheduler loop.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Parent task not found for {0}")]
    ParentNotFound(TaskId),

    #[error("Invalid transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Invalid routing: {0}")]
    InvalidRouting(String),

    #[error("Unknown dependency {dep} on task {task_id}")]
    UnknownDependency { task_id: TaskId, dep: TaskId },

    #[error("Dependency cycle detected involving task: {0}")]
    CycleDetected(TaskId),

    #[error("Task {task_id} is already leased by {holder}")]
    AlreadyLeased { task_id: TaskId, holder: String },

    #[error("Agent {agent} does not hold the lease on {task_id}")]
    NotLeaseHolder { task_id: TaskId, agent: String },

    #[error("Lease renewal cap reached for {task_id} ({renewals} renewals)")]
    RenewalCapReached { task_id: TaskId, renewals: u32 },

    #[error("Agent {agent} is not authorized to mutate {task_id}")]
    UnauthorizedAgent { task_id: TaskId, agent: String },

    #[error("Delegation depth exceeded for {task_id}: depth {depth} (subtasks may not delegate further)")]
    DelegationDepthExceeded { task_id: TaskId, depth: u32 },

    #[error("Gate '{gate}' cannot reject; send outcome 'complete' or 'blocked', or route the task to a rejectable gate")]
    GateNotRejectable { gate: String },

    #[error("Outcome 'needs_review' requires rejectionNotes describing what to fix")]
    MissingRejectionNotes,

    #[error("Outcome 'blocked' requires a non-empty blockers list")]
    MissingBlockers,

    #[error("Invalid outcome '{0}'; expected one of: done, blocked, needs_review, partial")]
    InvalidOutcome(String),

    #[error("Task {0} is not enrolled in a gate workflow")]
    NotInWorkflow(TaskId),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<std::io::Error> for DomainError {
    fn from(err: std::io::Error) -> Self {
        DomainError::Storage(err.to_string())
    }
}

impl From<serde_yaml::Error> for DomainError {
    fn from(err: serde_yaml::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}
