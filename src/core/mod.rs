//! Core scheduling abstractions: tasks, queue, dependencies, retries, resources, workflows, events.

pub mod dependency;
pub mod error;
pub mod events;
pub mod executor;
pub mod metrics;
pub mod queue;
pub mod resource_ledger;
pub mod retry;
pub mod scheduler;
pub mod task;
pub mod workflow;

pub use dependency::DependencyResolver;
pub use error::{AppResult, SchedulerError};
pub use events::{EngineEvent, EventBus, EventSink, InMemoryEventSink};
pub use executor::{handler_fn, FnHandler, Spawn, TaskContext, TaskHandler};
pub use metrics::{MetricsCollector, SchedulerMetrics};
pub use queue::{PendingQueue, QueueEntry};
pub use resource_ledger::{Resource, ResourceAllocation, ResourceLedger, ResourceSpec};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::TaskScheduler;
pub use task::{ResourceRequest, Task, TaskSpec, TaskStatus, Workflow, WorkflowSpec, WorkflowStatus};
pub use workflow::{WorkflowTracker, WorkflowTransition};
