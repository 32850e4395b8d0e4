//! Task and workflow records shared across the engine.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::executor::TaskHandler;
use crate::util::serde::{Priority, ResourceId, TaskId, WorkflowId};

/// Status of a task (and of a workflow) in the scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in the queue, parked on prerequisites/capacity, or waiting out a retry delay.
    #[default]
    Pending,
    /// Handler is in flight.
    Running,
    /// Handler succeeded.
    Completed,
    /// Handler failed and retries are exhausted.
    Failed,
    /// Cancelled by a caller.
    Cancelled,
}

/// Workflows share the task state machine.
pub type WorkflowStatus = TaskStatus;

impl TaskStatus {
    /// `completed`, `failed` and `cancelled` admit no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A reservation a task wants made before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Resource to draw from.
    pub resource_id: ResourceId,
    /// Units to reserve.
    pub amount: u64,
}

/// Snapshot of a task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identity.
    pub id: TaskId,
    /// Display name.
    pub name: String,
    /// Queue priority.
    pub priority: Priority,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Prerequisites that must complete first, in declaration order.
    pub dependencies: Vec<TaskId>,
    /// Per-task timeout; falls back to the scheduler default.
    pub timeout: Option<Duration>,
    /// Retries consumed so far.
    pub retry_count: u32,
    /// Retry budget for this task.
    pub max_retries: u32,
    /// Reservations made at admission.
    pub resources: Vec<ResourceRequest>,
    /// Owning workflow, if any.
    pub workflow_id: Option<WorkflowId>,
    /// Creation time (ms since epoch).
    pub created_at_ms: u128,
    /// Start of the latest attempt (ms since epoch).
    pub started_at_ms: Option<u128>,
    /// Time the task reached a terminal status (ms since epoch).
    pub completed_at_ms: Option<u128>,
    /// Handler result on success.
    pub result: Option<serde_json::Value>,
    /// Last error message.
    pub error: Option<String>,
    /// Last reported progress, 0–100.
    pub progress: Option<f64>,
}

impl Task {
    /// Milliseconds between start and completion, when both are known.
    #[must_use]
    pub fn execution_time_ms(&self) -> Option<u128> {
        match (self.started_at_ms, self.completed_at_ms) {
            (Some(start), Some(end)) => Some(end.saturating_sub(start)),
            _ => None,
        }
    }
}

/// Submission describing a task to schedule.
#[derive(Clone)]
pub struct TaskSpec {
    pub(crate) id: Option<TaskId>,
    pub(crate) name: String,
    pub(crate) handler: Arc<dyn TaskHandler>,
    pub(crate) priority: Priority,
    pub(crate) dependencies: Vec<TaskId>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_retries: Option<u32>,
    pub(crate) resources: Vec<ResourceRequest>,
}

impl TaskSpec {
    /// Create a spec with medium priority and scheduler defaults.
    pub fn new(name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            id: None,
            name: name.into(),
            handler,
            priority: Priority::default(),
            dependencies: Vec::new(),
            timeout: None,
            max_retries: None,
            resources: Vec::new(),
        }
    }

    /// Use a caller-reserved identity instead of a generated one.
    #[must_use]
    pub const fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the queue priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Add a prerequisite.
    #[must_use]
    pub fn depends_on(mut self, id: TaskId) -> Self {
        self.dependencies.push(id);
        self
    }

    /// Override the scheduler's default timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the scheduler's default retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Reserve `amount` units of `resource_id` when the task is admitted.
    #[must_use]
    pub fn requires(mut self, resource_id: ResourceId, amount: u64) -> Self {
        self.resources.push(ResourceRequest { resource_id, amount });
        self
    }

    /// Reserved identity, if one was set.
    #[must_use]
    pub const fn id(&self) -> Option<TaskId> {
        self.id
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("dependencies", &self.dependencies)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

/// Submission describing a workflow: a named set of tasks tracked as a unit.
#[derive(Debug, Clone)]
pub struct WorkflowSpec {
    pub(crate) name: String,
    pub(crate) tasks: Vec<TaskSpec>,
}

impl WorkflowSpec {
    /// Create an empty workflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
        }
    }

    /// Append a member task.
    #[must_use]
    pub fn task(mut self, spec: TaskSpec) -> Self {
        self.tasks.push(spec);
        self
    }
}

/// Snapshot of a workflow record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identity.
    pub id: WorkflowId,
    /// Display name.
    pub name: String,
    /// Member tasks in submission order.
    pub task_ids: Vec<TaskId>,
    /// Aggregate status derived from the members.
    pub status: WorkflowStatus,
    /// Creation time (ms since epoch).
    pub created_at_ms: u128,
    /// First member start (ms since epoch).
    pub started_at_ms: Option<u128>,
    /// Terminal transition time (ms since epoch).
    pub completed_at_ms: Option<u128>,
    /// Error of the member that failed the workflow.
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_string(&TaskStatus::Cancelled).unwrap(), "\"cancelled\"");
    }
}
