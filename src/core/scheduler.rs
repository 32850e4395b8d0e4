//! Concurrency-bounded task scheduler.
//!
//! `TaskScheduler` owns a single [`parking_lot::Mutex`] around the engine
//! state. The lock is never held across an `.await`: every operation mutates
//! state, collects the resulting events and executions, drops the guard, and
//! only then publishes events and spawns work on the runtime.
//!
//! Admission after `add_task`, `add_workflow`, `resume` and `update_config`
//! is deferred to a spawned pass so that a burst of submissions is
//! priority-ordered before any of it starts. Completion, failure, cancel and
//! retry re-insertion admit inline.

mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, Notify};

use crate::config::{ConfigUpdate, EngineConfig};
use crate::core::events::{EngineEvent, EventBus, EventSink};
use crate::core::executor::{Spawn, TaskContext, TaskReporter};
use crate::core::metrics::SchedulerMetrics;
use crate::core::resource_ledger::{Resource, ResourceAllocation, ResourceSpec};
use crate::core::task::{Task, TaskSpec, Workflow, WorkflowSpec};
use crate::core::SchedulerError;
use crate::util::serde::{ResourceId, TaskId, WorkflowId};

use self::state::{EngineState, Outcome, Start};

struct Inner<S> {
    state: Mutex<EngineState>,
    events: EventBus,
    spawner: S,
    pump_scheduled: AtomicBool,
    /// Signalled after every state change that may settle a task or workflow.
    settled: Notify,
}

/// Concurrency-bounded task and workflow scheduler.
///
/// Cheap to clone; clones share the same engine.
pub struct TaskScheduler<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for TaskScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> std::fmt::Debug for TaskScheduler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TaskScheduler")
            .field("paused", &state.paused)
            .field("max_concurrent_tasks", &state.config.max_concurrent_tasks)
            .field("events", &self.inner.events)
            .finish_non_exhaustive()
    }
}

impl<S> TaskScheduler<S>
where
    S: Spawn + Send + Sync + 'static,
{
    /// Create a scheduler.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when the configuration does not validate.
    pub fn new(config: EngineConfig, spawner: S) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;
        let events = EventBus::new(config.event_capacity, config.max_subscribers);
        tracing::info!(
            max_concurrent_tasks = config.max_concurrent_tasks,
            max_queue_size = config.max_queue_size,
            "task scheduler created"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(EngineState::new(config)),
                events,
                spawner,
                pump_scheduled: AtomicBool::new(false),
                settled: Notify::new(),
            }),
        })
    }

    /// Submit a task. It starts once a slot is free and its prerequisites have completed.
    ///
    /// # Errors
    ///
    /// `SchedulerDisabled` while paused, `Validation` for a malformed spec, a
    /// duplicate id or a dependency cycle, `QueueFull` under the reject
    /// overflow policy, `ResourceNotFound`/`FeatureDisabled` for bad resource
    /// requirements.
    pub fn add_task(&self, spec: TaskSpec) -> Result<TaskId, SchedulerError> {
        let id = spec.id.unwrap_or_default();
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if state.paused {
                return Err(SchedulerError::SchedulerDisabled);
            }
            state.validate_batch(&[(id, &spec)])?;
            state.insert_task(id, spec, None, &mut events);
        }
        self.inner.events.publish_all(events);
        self.schedule_pump();
        Ok(id)
    }

    /// Submit a workflow: its member tasks are validated together and enqueued in order.
    ///
    /// # Errors
    ///
    /// `FeatureDisabled` when workflows are off, `Validation` for an empty
    /// workflow, otherwise as [`TaskScheduler::add_task`] for any member.
    pub fn add_workflow(&self, spec: WorkflowSpec) -> Result<WorkflowId, SchedulerError> {
        let mut events = Vec::new();
        let workflow_id = {
            let mut state = self.inner.state.lock();
            if !state.config.enable_workflow {
                return Err(SchedulerError::FeatureDisabled("workflows"));
            }
            if state.paused {
                return Err(SchedulerError::SchedulerDisabled);
            }
            if spec.name.trim().is_empty() {
                return Err(SchedulerError::Validation("workflow name is required".into()));
            }
            if spec.tasks.is_empty() {
                return Err(SchedulerError::Validation(format!(
                    "workflow `{}` has no tasks",
                    spec.name
                )));
            }

            let members: Vec<(TaskId, TaskSpec)> = spec
                .tasks
                .into_iter()
                .map(|t| (t.id.unwrap_or_default(), t))
                .collect();
            let batch: Vec<(TaskId, &TaskSpec)> = members.iter().map(|(id, t)| (*id, t)).collect();
            state.validate_batch(&batch)?;

            let workflow_id = WorkflowId::new();
            let task_ids: Vec<TaskId> = members.iter().map(|(id, _)| *id).collect();
            state.workflows.register(workflow_id, spec.name.clone(), task_ids.clone());
            events.push(EngineEvent::WorkflowAdded {
                workflow_id,
                name: spec.name,
                task_ids,
            });
            for (id, task) in members {
                state.insert_task(id, task, Some(workflow_id), &mut events);
            }
            tracing::info!(workflow_id = %workflow_id, "workflow added");
            workflow_id
        };
        self.inner.events.publish_all(events);
        self.schedule_pump();
        Ok(workflow_id)
    }

    /// Cancel a pending or running task.
    ///
    /// A running handler is signalled through its cancellation token; the task
    /// is marked `cancelled` and its resources released immediately. Returns
    /// `false` for unknown or already terminal tasks.
    pub fn cancel_task(&self, task_id: TaskId) -> bool {
        let mut events = Vec::new();
        let (cancelled, starts) = {
            let mut state = self.inner.state.lock();
            let cancelled = state.cancel(task_id, &mut events, true);
            (cancelled, state.admit(&mut events))
        };
        self.dispatch(events, starts);
        cancelled
    }

    /// Cancel every non-terminal member, then mark the workflow `cancelled`.
    ///
    /// Returns `false` for unknown or already terminal workflows.
    pub fn cancel_workflow(&self, workflow_id: WorkflowId) -> bool {
        let mut events = Vec::new();
        let starts = {
            let mut state = self.inner.state.lock();
            let Some(members) = state.workflows.cancel(&workflow_id) else {
                return false;
            };
            for task_id in members {
                state.cancel(task_id, &mut events, true);
            }
            tracing::info!(workflow_id = %workflow_id, "workflow cancelled");
            events.push(EngineEvent::WorkflowCancelled { workflow_id });
            state.admit(&mut events)
        };
        self.dispatch(events, starts);
        true
    }

    /// Register a finite resource.
    ///
    /// # Errors
    ///
    /// `FeatureDisabled` when resource management is off, `Validation` for an
    /// empty name or zero capacity.
    pub fn register_resource(&self, spec: ResourceSpec) -> Result<ResourceId, SchedulerError> {
        let resource = {
            let mut state = self.inner.state.lock();
            if !state.config.enable_resource_management {
                return Err(SchedulerError::FeatureDisabled("resource management"));
            }
            state.ledger.register(spec)?
        };
        tracing::info!(resource_id = %resource.id, name = %resource.name, capacity = resource.capacity, "resource registered");
        self.inner.events.publish(EngineEvent::ResourceAdded {
            resource_id: resource.id,
            name: resource.name,
            capacity: resource.capacity,
        });
        Ok(resource.id)
    }

    /// Reserve `amount` units of a resource for a task until it reaches a terminal state.
    ///
    /// Returns `Ok(false)` when capacity is short or the task is already terminal.
    ///
    /// # Errors
    ///
    /// `FeatureDisabled`, `TaskNotFound`, `ResourceNotFound`, or `Validation`
    /// for a zero amount.
    pub fn allocate_resource(
        &self,
        task_id: TaskId,
        resource_id: ResourceId,
        amount: u64,
    ) -> Result<bool, SchedulerError> {
        {
            let mut state = self.inner.state.lock();
            if !state.config.enable_resource_management {
                return Err(SchedulerError::FeatureDisabled("resource management"));
            }
            let task = state.task(&task_id).ok_or(SchedulerError::TaskNotFound(task_id))?;
            if task.status.is_terminal() {
                return Ok(false);
            }
            if !state.ledger.allocate(task_id, resource_id, amount)? {
                tracing::debug!(task_id = %task_id, resource_id = %resource_id, amount, "allocation refused");
                return Ok(false);
            }
        }
        self.inner.events.publish(EngineEvent::ResourceAllocated {
            task_id,
            resource_id,
            amount,
        });
        Ok(true)
    }

    /// Task snapshot.
    #[must_use]
    pub fn get_task(&self, task_id: &TaskId) -> Option<Task> {
        self.inner.state.lock().task(task_id)
    }

    /// Workflow snapshot.
    #[must_use]
    pub fn get_workflow(&self, workflow_id: &WorkflowId) -> Option<Workflow> {
        self.inner.state.lock().workflows.get(workflow_id)
    }

    /// All known workflows, oldest first.
    #[must_use]
    pub fn get_workflows(&self) -> Vec<Workflow> {
        let mut workflows = self.inner.state.lock().workflows.workflows();
        workflows.sort_by_key(|w| w.created_at_ms);
        workflows
    }

    /// Resource snapshot.
    #[must_use]
    pub fn get_resource(&self, resource_id: &ResourceId) -> Option<Resource> {
        self.inner.state.lock().ledger.get(resource_id)
    }

    /// All registered resources.
    #[must_use]
    pub fn get_resources(&self) -> Vec<Resource> {
        self.inner.state.lock().ledger.resources()
    }

    /// Allocation history of a task, released entries included.
    ///
    /// Empty for unknown tasks and for tasks whose records were purged.
    #[must_use]
    pub fn get_allocations(&self, task_id: &TaskId) -> Vec<ResourceAllocation> {
        self.inner.state.lock().ledger.allocations_for(task_id)
    }

    /// Metrics snapshot.
    #[must_use]
    pub fn get_metrics(&self) -> SchedulerMetrics {
        self.inner.state.lock().metrics()
    }

    /// Pending tasks: queued ones in dequeue order, then parked ones.
    #[must_use]
    pub fn get_task_queue(&self) -> Vec<Task> {
        self.inner.state.lock().pending_tasks()
    }

    /// Running tasks, earliest started first.
    #[must_use]
    pub fn get_running_tasks(&self) -> Vec<Task> {
        self.inner.state.lock().running_tasks()
    }

    /// Up to `limit` completed tasks, most recent first.
    #[must_use]
    pub fn get_completed_tasks(&self, limit: usize) -> Vec<Task> {
        self.inner.state.lock().completed_tasks(limit)
    }

    /// Stop admitting work and refuse submissions. Running tasks continue.
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
        tracing::info!("scheduler paused");
    }

    /// Resume admission.
    pub fn resume(&self) {
        self.inner.state.lock().paused = false;
        tracing::info!("scheduler resumed");
        self.schedule_pump();
    }

    /// Whether the scheduler is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// Cancel every pending task. Returns how many were removed.
    pub fn clear_queue(&self) -> usize {
        let mut events = Vec::new();
        let count = self.inner.state.lock().clear_pending(&mut events);
        self.dispatch(events, Vec::new());
        count
    }

    /// Forget terminal tasks that finished at least `older_than` ago.
    ///
    /// Members of an unfinished workflow and prerequisites of a live task are
    /// kept. Returns the number removed.
    pub fn clear_completed_tasks(&self, older_than: Duration) -> usize {
        let removed = self.inner.state.lock().purge_terminal(older_than);
        tracing::debug!(removed, "terminal tasks purged");
        removed
    }

    /// Apply a partial configuration update and return the configuration now in effect.
    ///
    /// Event channel sizing is fixed at construction.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when the merged configuration does not validate; nothing changes.
    pub fn update_config(&self, update: &ConfigUpdate) -> Result<EngineConfig, SchedulerError> {
        let mut events = Vec::new();
        let next = {
            let mut state = self.inner.state.lock();
            let next = update.apply(&state.config);
            next.validate().map_err(SchedulerError::InvalidConfig)?;
            state.apply_config(next.clone(), &mut events);
            next
        };
        self.inner.events.publish_all(events);
        self.schedule_pump();
        Ok(next)
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> EngineConfig {
        self.inner.state.lock().config.clone()
    }

    /// Subscribe to lifecycle events.
    ///
    /// # Errors
    ///
    /// `TooManySubscribers` when the subscriber list is full.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<EngineEvent>, SchedulerError> {
        self.inner.events.subscribe()
    }

    /// Attach a synchronous event sink.
    ///
    /// # Errors
    ///
    /// `TooManySubscribers` when the subscriber list is full.
    pub fn attach_sink(&self, sink: Arc<dyn EventSink>) -> Result<(), SchedulerError> {
        self.inner.events.attach(sink)
    }

    /// Wait until the task reaches a terminal state and return its final snapshot.
    ///
    /// # Errors
    ///
    /// `TaskNotFound` for unknown (or purged) tasks.
    pub async fn wait_for_task(&self, task_id: TaskId) -> Result<Task, SchedulerError> {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.get_task(&task_id) {
                None => return Err(SchedulerError::TaskNotFound(task_id)),
                Some(task) if task.status.is_terminal() => return Ok(task),
                Some(_) => {}
            }
            notified.await;
        }
    }

    /// Wait until the workflow reaches a terminal state and return its final snapshot.
    ///
    /// # Errors
    ///
    /// `WorkflowNotFound` for unknown workflows.
    pub async fn wait_for_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow, SchedulerError> {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.get_workflow(&workflow_id) {
                None => return Err(SchedulerError::WorkflowNotFound(workflow_id)),
                Some(wf) if wf.status.is_terminal() => return Ok(wf),
                Some(_) => {}
            }
            notified.await;
        }
    }

    /// Schedule one deferred admission pass; concurrent requests coalesce.
    fn schedule_pump(&self) {
        if self.inner.pump_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = self.clone();
        self.inner.spawner.spawn(async move {
            this.inner.pump_scheduled.store(false, Ordering::Release);
            this.pump();
        });
    }

    fn pump(&self) {
        let mut events = Vec::new();
        let starts = self.inner.state.lock().admit(&mut events);
        self.dispatch(events, starts);
    }

    /// Publish collected events, wake waiters, launch admitted executions.
    fn dispatch(&self, events: Vec<EngineEvent>, starts: Vec<Start>) {
        self.inner.events.publish_all(events);
        self.inner.settled.notify_waiters();
        for start in starts {
            self.launch(start);
        }
    }

    /// Run the handler on the runtime and race its outcome against the
    /// timeout and the cancellation token.
    fn launch(&self, start: Start) {
        let Start {
            task_id,
            execution,
            attempt,
            handler,
            timeout,
            token,
            dependency_results,
        } = start;
        let reporter: Arc<dyn TaskReporter> = Arc::new(SchedulerReporter {
            inner: Arc::downgrade(&self.inner),
        });
        let ctx = TaskContext::new(
            task_id,
            attempt,
            execution,
            token.clone(),
            dependency_results,
            reporter,
        );

        let (tx, rx) = oneshot::channel();
        self.inner.spawner.spawn(async move {
            // The receiver is gone after a timeout or cancel; the result is discarded.
            let _ = tx.send(handler.run(ctx).await);
        });

        let this = self.clone();
        self.inner.spawner.spawn(async move {
            let outcome = tokio::select! {
                result = rx => match result {
                    Ok(Ok(value)) => Outcome::Completed(value),
                    Ok(Err(err)) => Outcome::Failed(format!("{err:#}")),
                    Err(_) => Outcome::Failed(SchedulerError::Runtime("task handler panicked".into()).to_string()),
                },
                () = tokio::time::sleep(timeout) => {
                    tracing::warn!(task_id = %task_id, timeout_ms = %timeout.as_millis(), "task timed out");
                    token.cancel();
                    Outcome::Failed(SchedulerError::Timeout(timeout.as_millis()).to_string())
                }
                () = token.cancelled() => return,
            };
            this.finish(task_id, execution, outcome);
        });
    }

    fn finish(&self, task_id: TaskId, execution: u64, outcome: Outcome) {
        let mut events = Vec::new();
        let (starts, retry) = {
            let mut state = self.inner.state.lock();
            let retry = state.finish(task_id, execution, outcome, &mut events);
            (state.admit(&mut events), retry)
        };
        self.dispatch(events, starts);
        if let Some(delay) = retry {
            self.schedule_requeue(task_id, delay);
        }
    }

    fn schedule_requeue(&self, task_id: TaskId, delay: Duration) {
        let this = self.clone();
        self.inner.spawner.spawn(async move {
            tokio::time::sleep(delay).await;
            this.requeue(task_id);
        });
    }

    fn requeue(&self, task_id: TaskId) {
        let mut events = Vec::new();
        let starts = {
            let mut state = self.inner.state.lock();
            if !state.requeue(task_id) {
                // Cancelled or purged during the delay.
                tracing::debug!(task_id = %task_id, "retry dropped");
                return;
            }
            state.admit(&mut events)
        };
        self.dispatch(events, starts);
    }

    /// Whether a task id is known.
    #[must_use]
    pub fn contains_task(&self, task_id: &TaskId) -> bool {
        self.inner.state.lock().contains(task_id)
    }
}

/// Routes handler progress and custom events back into the engine.
struct SchedulerReporter<S> {
    inner: Weak<Inner<S>>,
}

impl<S> SchedulerReporter<S>
where
    S: Send + Sync + 'static,
{
    fn report(&self, task_id: TaskId, execution: u64, build: impl FnOnce(&mut Task) -> EngineEvent) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let event = {
            let mut state = inner.state.lock();
            match state.live_record_mut(task_id, execution) {
                Some(task) => build(task),
                // Finished, timed out or cancelled.
                None => return,
            }
        };
        inner.events.publish(event);
    }
}

impl<S> TaskReporter for SchedulerReporter<S>
where
    S: Send + Sync + 'static,
{
    fn progress(&self, task_id: TaskId, execution: u64, progress: f64) {
        self.report(task_id, execution, |task| {
            task.progress = Some(progress);
            EngineEvent::TaskProgress { task_id, progress }
        });
    }

    fn emit(&self, task_id: TaskId, execution: u64, name: String, payload: Value) {
        self.report(task_id, execution, |_| EngineEvent::TaskEvent {
            task_id,
            name,
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::executor::handler_fn;
    use crate::runtime::TokioSpawner;

    fn scheduler(config: EngineConfig) -> TaskScheduler<TokioSpawner> {
        TaskScheduler::new(config, TokioSpawner::new(tokio::runtime::Handle::current())).unwrap()
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let err = TaskScheduler::new(
            EngineConfig::default().with_max_concurrent_tasks(0),
            TokioSpawner::new(tokio::runtime::Handle::current()),
        )
        .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_stale_outcome_is_discarded() {
        let s = scheduler(EngineConfig::default());
        let id = s
            .add_task(TaskSpec::new(
                "slow",
                handler_fn(|ctx: TaskContext| async move {
                    ctx.cancelled().await;
                    Ok(Value::Null)
                }),
            ))
            .unwrap();
        tokio::task::yield_now().await;
        assert!(s.cancel_task(id));

        // An outcome from an execution that is no longer live changes nothing.
        s.finish(id, 1, Outcome::Completed(Value::Bool(true)));
        let task = s.get_task(&id).unwrap();
        assert_eq!(task.status, crate::core::TaskStatus::Cancelled);
        assert!(task.result.is_none());
    }

    #[tokio::test]
    async fn test_submissions_in_one_turn_share_one_pump() {
        let s = scheduler(EngineConfig::default().with_max_concurrent_tasks(1));
        for n in 0..3 {
            s.add_task(TaskSpec::new(
                format!("t{n}"),
                handler_fn(|_| async { Ok(Value::Null) }),
            ))
            .unwrap();
        }
        assert!(s.inner.pump_scheduled.load(Ordering::Acquire));
        assert!(s.get_running_tasks().is_empty());
        assert_eq!(s.get_task_queue().len(), 3);
    }
}
