//! Typed lifecycle events and the bounded event bus.
//!
//! Collaborators observe the engine either through an [`EventSink`] attached
//! to the bus (synchronous, called in publish order) or through a broadcast
//! receiver from [`EventBus::subscribe`]. Both count against the same
//! subscriber limit.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::EngineConfig;
use crate::core::SchedulerError;
use crate::util::serde::{Priority, ResourceId, TaskId, WorkflowId};

/// Lifecycle event. [`EngineEvent::name`] is the wire name collaborators match on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// `task:added`
    TaskAdded {
        /// Task.
        task_id: TaskId,
        /// Display name.
        name: String,
        /// Queue priority.
        priority: Priority,
    },
    /// `task:started`
    TaskStarted {
        /// Task.
        task_id: TaskId,
        /// Retry count at start.
        attempt: u32,
    },
    /// `task:progress`
    TaskProgress {
        /// Task.
        task_id: TaskId,
        /// Progress 0–100.
        progress: f64,
    },
    /// `task:completed`
    TaskCompleted {
        /// Task.
        task_id: TaskId,
        /// Execution time of the successful attempt.
        duration_ms: u128,
    },
    /// `task:failed`
    TaskFailed {
        /// Task.
        task_id: TaskId,
        /// Final error.
        error: String,
    },
    /// `task:retry`
    TaskRetry {
        /// Task.
        task_id: TaskId,
        /// Retry count after this failure.
        attempt: u32,
        /// Error of the failed attempt.
        error: String,
        /// Delay before re-queueing.
        delay_ms: u64,
    },
    /// `task:cancelled`
    TaskCancelled {
        /// Task.
        task_id: TaskId,
    },
    /// `task:event`, emitted by a handler through its context.
    TaskEvent {
        /// Task.
        task_id: TaskId,
        /// Handler-chosen name.
        name: String,
        /// Handler-chosen payload.
        payload: Value,
    },
    /// `workflow:added`
    WorkflowAdded {
        /// Workflow.
        workflow_id: WorkflowId,
        /// Display name.
        name: String,
        /// Members in submission order.
        task_ids: Vec<TaskId>,
    },
    /// `workflow:completed`
    WorkflowCompleted {
        /// Workflow.
        workflow_id: WorkflowId,
    },
    /// `workflow:failed`
    WorkflowFailed {
        /// Workflow.
        workflow_id: WorkflowId,
        /// Member that failed.
        task_id: TaskId,
        /// Its error.
        error: Option<String>,
    },
    /// `workflow:cancelled`
    WorkflowCancelled {
        /// Workflow.
        workflow_id: WorkflowId,
    },
    /// `resource:added`
    ResourceAdded {
        /// Resource.
        resource_id: ResourceId,
        /// Display name.
        name: String,
        /// Total units.
        capacity: u64,
    },
    /// `resource:allocated`
    ResourceAllocated {
        /// Holder.
        task_id: TaskId,
        /// Resource.
        resource_id: ResourceId,
        /// Units reserved.
        amount: u64,
    },
    /// `resource:released`
    ResourceReleased {
        /// Former holder.
        task_id: TaskId,
        /// Resource.
        resource_id: ResourceId,
        /// Units returned.
        amount: u64,
    },
    /// `queue:full`, raised for the newest item.
    QueueFull {
        /// Newest submission.
        task_id: TaskId,
        /// Pending count including it.
        size: usize,
        /// Configured capacity.
        capacity: usize,
    },
    /// `queue:cleared`
    QueueCleared {
        /// Tasks removed.
        count: usize,
    },
    /// `config:updated`
    ConfigUpdated {
        /// Configuration now in effect.
        config: EngineConfig,
    },
}

impl EngineEvent {
    /// Wire name, e.g. `task:completed`.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::TaskAdded { .. } => "task:added",
            Self::TaskStarted { .. } => "task:started",
            Self::TaskProgress { .. } => "task:progress",
            Self::TaskCompleted { .. } => "task:completed",
            Self::TaskFailed { .. } => "task:failed",
            Self::TaskRetry { .. } => "task:retry",
            Self::TaskCancelled { .. } => "task:cancelled",
            Self::TaskEvent { .. } => "task:event",
            Self::WorkflowAdded { .. } => "workflow:added",
            Self::WorkflowCompleted { .. } => "workflow:completed",
            Self::WorkflowFailed { .. } => "workflow:failed",
            Self::WorkflowCancelled { .. } => "workflow:cancelled",
            Self::ResourceAdded { .. } => "resource:added",
            Self::ResourceAllocated { .. } => "resource:allocated",
            Self::ResourceReleased { .. } => "resource:released",
            Self::QueueFull { .. } => "queue:full",
            Self::QueueCleared { .. } => "queue:cleared",
            Self::ConfigUpdated { .. } => "config:updated",
        }
    }

    /// Task the event concerns, if any.
    #[must_use]
    pub const fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::TaskAdded { task_id, .. }
            | Self::TaskStarted { task_id, .. }
            | Self::TaskProgress { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskRetry { task_id, .. }
            | Self::TaskCancelled { task_id }
            | Self::TaskEvent { task_id, .. }
            | Self::WorkflowFailed { task_id, .. }
            | Self::ResourceAllocated { task_id, .. }
            | Self::ResourceReleased { task_id, .. }
            | Self::QueueFull { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

/// Synchronous event observer.
pub trait EventSink: Send + Sync {
    /// Observe one event. Called outside the scheduler lock.
    fn record(&self, event: &EngineEvent);
}

/// In-memory sink keeping the most recent events, for testing and dev.
#[derive(Clone)]
pub struct InMemoryEventSink {
    events: Arc<Mutex<VecDeque<EngineEvent>>>,
    max_events: usize,
}

impl InMemoryEventSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(max_events.min(1024)))),
            max_events: max_events.max(1),
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Wire names of stored events, oldest first.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(EngineEvent::name).collect()
    }

    /// Number of stored events with the given wire name.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    /// Stored events concerning one task, oldest first.
    #[must_use]
    pub fn for_task(&self, task_id: TaskId) -> Vec<EngineEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.task_id() == Some(task_id))
            .cloned()
            .collect()
    }
}

impl EventSink for InMemoryEventSink {
    fn record(&self, event: &EngineEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}

/// Fan-out point for lifecycle events with a bounded subscriber list.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    max_subscribers: usize,
}

impl EventBus {
    /// Create a bus whose broadcast channel buffers `capacity` events per receiver.
    #[must_use]
    pub fn new(capacity: usize, max_subscribers: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sinks: RwLock::new(Vec::new()),
            max_subscribers,
        }
    }

    /// Current subscriber count (sinks plus live receivers).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sinks.read().len() + self.sender.receiver_count()
    }

    /// Subscribe through a broadcast receiver. Slow receivers observe `Lagged`.
    ///
    /// # Errors
    ///
    /// `TooManySubscribers` when the list is full.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<EngineEvent>, SchedulerError> {
        if self.subscriber_count() >= self.max_subscribers {
            return Err(SchedulerError::TooManySubscribers(self.max_subscribers));
        }
        Ok(self.sender.subscribe())
    }

    /// Attach a synchronous sink.
    ///
    /// # Errors
    ///
    /// `TooManySubscribers` when the list is full.
    pub fn attach(&self, sink: Arc<dyn EventSink>) -> Result<(), SchedulerError> {
        let mut sinks = self.sinks.write();
        if sinks.len() + self.sender.receiver_count() >= self.max_subscribers {
            return Err(SchedulerError::TooManySubscribers(self.max_subscribers));
        }
        sinks.push(sink);
        Ok(())
    }

    /// Deliver events in order to every sink and receiver.
    pub fn publish_all(&self, events: Vec<EngineEvent>) {
        if events.is_empty() {
            return;
        }
        let sinks = self.sinks.read().clone();
        for event in events {
            tracing::trace!(event = event.name(), "publishing event");
            for sink in &sinks {
                sink.record(&event);
            }
            // No live receivers is not an error.
            let _ = self.sender.send(event);
        }
    }

    /// Deliver a single event.
    pub fn publish(&self, event: EngineEvent) {
        self.publish_all(vec![event]);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("max_subscribers", &self.max_subscribers)
            .finish()
    }
}
