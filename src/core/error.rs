//! Error types for scheduler operations.

use thiserror::Error;

use crate::util::serde::{ResourceId, TaskId, WorkflowId};

/// Errors produced by scheduler components.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// No task with this identity is known.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    /// No workflow with this identity is known.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),
    /// No resource with this identity is registered.
    #[error("resource not found: {0}")]
    ResourceNotFound(ResourceId),
    /// Submission attempted while the scheduler is paused.
    #[error("scheduler is paused")]
    SchedulerDisabled,
    /// Pending queue is at its configured capacity.
    #[error("queue full: {0}")]
    QueueFull(String),
    /// Malformed task, workflow or resource submission.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The requested subsystem is switched off in the configuration.
    #[error("{0} is disabled")]
    FeatureDisabled(&'static str),
    /// The event bus subscriber list is full.
    #[error("too many subscribers (max {0})")]
    TooManySubscribers(usize),
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Handler exceeded its deadline.
    #[error("task timed out after {0}ms")]
    Timeout(u128),
    /// Handler was cancelled before producing an outcome.
    #[error("task cancelled")]
    Cancelled,
    /// A prerequisite ended without completing.
    #[error("dependency {0} did not complete")]
    DependencyFailed(TaskId),
    /// Runtime adapter failure.
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
