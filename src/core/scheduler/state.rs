//! Lock-guarded engine state: task table, queue, parking lots, ledger, workflows, metrics.
//!
//! Every method runs under the scheduler mutex and only appends to an event
//! buffer; publishing happens after the lock is released.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{DependencyFailurePolicy, EngineConfig, OverflowPolicy};
use crate::core::dependency::DependencyResolver;
use crate::core::events::EngineEvent;
use crate::core::executor::TaskHandler;
use crate::core::metrics::{MetricsCollector, SchedulerMetrics};
use crate::core::queue::{PendingQueue, QueueEntry};
use crate::core::resource_ledger::ResourceLedger;
use crate::core::retry::{RetryDecision, RetryPolicy};
use crate::core::task::{Task, TaskSpec, TaskStatus, WorkflowStatus};
use crate::core::workflow::{WorkflowTracker, WorkflowTransition};
use crate::core::SchedulerError;
use crate::util::clock::now_ms;
use crate::util::serde::{TaskId, WorkflowId};

pub(super) struct TaskRecord {
    pub(super) task: Task,
    handler: Arc<dyn TaskHandler>,
    seq: u64,
    /// Bumped on every start; outcomes from older executions are stale.
    execution: u64,
    cancel: Option<CancellationToken>,
    /// Declared requirements are held (kept across retries).
    reserved: bool,
}

impl TaskRecord {
    const fn entry(&self) -> QueueEntry {
        QueueEntry {
            task_id: self.task.id,
            priority: self.task.priority,
            seq: self.seq,
        }
    }
}

/// Everything needed to launch one execution outside the lock.
pub(super) struct Start {
    pub(super) task_id: TaskId,
    pub(super) execution: u64,
    pub(super) attempt: u32,
    pub(super) handler: Arc<dyn TaskHandler>,
    pub(super) timeout: Duration,
    pub(super) token: CancellationToken,
    pub(super) dependency_results: HashMap<TaskId, Value>,
}

/// Outcome of one execution.
pub(super) enum Outcome {
    Completed(Value),
    Failed(String),
}

pub(super) struct EngineState {
    pub(super) config: EngineConfig,
    pub(super) paused: bool,
    tasks: HashMap<TaskId, TaskRecord>,
    queue: PendingQueue,
    resolver: DependencyResolver,
    capacity_waiters: Vec<TaskId>,
    running: HashSet<TaskId>,
    pub(super) ledger: ResourceLedger,
    pub(super) workflows: WorkflowTracker,
    metrics: MetricsCollector,
    next_seq: u64,
    next_execution: u64,
}

fn validate_spec(spec: &TaskSpec) -> Result<(), SchedulerError> {
    if spec.name.trim().is_empty() {
        return Err(SchedulerError::Validation("task name is required".into()));
    }
    if spec.timeout.is_some_and(|t| t.is_zero()) {
        return Err(SchedulerError::Validation(format!(
            "task `{}` timeout must be greater than 0",
            spec.name
        )));
    }
    Ok(())
}

impl EngineState {
    pub(super) fn new(config: EngineConfig) -> Self {
        Self {
            queue: PendingQueue::new(config.enable_priority_queue),
            metrics: MetricsCollector::new(config.metrics_window),
            config,
            paused: false,
            tasks: HashMap::new(),
            resolver: DependencyResolver::new(),
            capacity_waiters: Vec::new(),
            running: HashSet::new(),
            ledger: ResourceLedger::new(),
            workflows: WorkflowTracker::new(),
            next_seq: 0,
            next_execution: 0,
        }
    }

    /// Tasks waiting for admission: queued plus parked.
    fn pending_len(&self) -> usize {
        self.queue.len() + self.resolver.parked_count() + self.capacity_waiters.len()
    }

    /// Validate a batch of submissions as a unit; nothing is inserted.
    pub(super) fn validate_batch(&self, batch: &[(TaskId, &TaskSpec)]) -> Result<(), SchedulerError> {
        let mut seen = HashSet::new();
        for (id, spec) in batch {
            validate_spec(spec)?;
            if self.tasks.contains_key(id) || !seen.insert(*id) {
                return Err(SchedulerError::Validation(format!("duplicate task id {id}")));
            }
            if spec.dependencies.contains(id) {
                return Err(SchedulerError::Validation(format!("task {id} depends on itself")));
            }
            if !spec.resources.is_empty() {
                if !self.config.enable_resource_management {
                    return Err(SchedulerError::FeatureDisabled("resource management"));
                }
                for req in &spec.resources {
                    self.ledger.check_request(req)?;
                }
            }
        }

        let siblings: HashMap<TaskId, &[TaskId]> = batch
            .iter()
            .map(|(id, spec)| (*id, spec.dependencies.as_slice()))
            .collect();
        for (id, spec) in batch {
            let cyclic = DependencyResolver::would_cycle(*id, &spec.dependencies, |d| {
                siblings
                    .get(d)
                    .map(|deps| deps.to_vec())
                    .or_else(|| self.tasks.get(d).map(|r| r.task.dependencies.clone()))
            });
            if cyclic {
                return Err(SchedulerError::Validation(format!(
                    "task {id} would close a dependency cycle"
                )));
            }
        }

        let pending = self.pending_len();
        if self.config.queue_overflow == OverflowPolicy::Reject
            && pending + batch.len() > self.config.max_queue_size
        {
            tracing::warn!(pending, capacity = self.config.max_queue_size, "submission rejected, queue full");
            return Err(SchedulerError::QueueFull(format!(
                "{pending} tasks pending, capacity {}",
                self.config.max_queue_size
            )));
        }
        Ok(())
    }

    /// Insert a validated task as `pending` and enqueue it.
    pub(super) fn insert_task(
        &mut self,
        id: TaskId,
        spec: TaskSpec,
        workflow_id: Option<WorkflowId>,
        events: &mut Vec<EngineEvent>,
    ) {
        let pending = self.pending_len();
        self.next_seq += 1;
        let task = Task {
            id,
            name: spec.name,
            priority: spec.priority,
            status: TaskStatus::Pending,
            dependencies: spec.dependencies,
            timeout: spec.timeout,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(self.config.max_retries),
            resources: spec.resources,
            workflow_id,
            created_at_ms: now_ms(),
            started_at_ms: None,
            completed_at_ms: None,
            result: None,
            error: None,
            progress: None,
        };
        let record = TaskRecord {
            task,
            handler: spec.handler,
            seq: self.next_seq,
            execution: 0,
            cancel: None,
            reserved: false,
        };
        self.queue.push(record.entry());
        tracing::debug!(task_id = %id, priority = %record.task.priority, "task queued");
        events.push(EngineEvent::TaskAdded {
            task_id: id,
            name: record.task.name.clone(),
            priority: record.task.priority,
        });
        self.tasks.insert(id, record);
        self.metrics.record_submitted();

        if pending >= self.config.max_queue_size {
            tracing::warn!(
                task_id = %id,
                size = pending + 1,
                capacity = self.config.max_queue_size,
                "queue over capacity"
            );
            events.push(EngineEvent::QueueFull {
                task_id: id,
                size: pending + 1,
                capacity: self.config.max_queue_size,
            });
        }
    }

    /// Admission pass: start queued tasks while slots are free.
    pub(super) fn admit(&mut self, events: &mut Vec<EngineEvent>) -> Vec<Start> {
        let mut starts = Vec::new();
        if self.paused {
            return starts;
        }
        while self.running.len() < self.config.max_concurrent_tasks {
            let Some(entry) = self.queue.pop() else {
                break;
            };
            let id = entry.task_id;
            let Some(record) = self.tasks.get(&id) else {
                continue;
            };
            if record.task.status != TaskStatus::Pending {
                continue;
            }
            let dependencies = record.task.dependencies.clone();
            let resources = record.task.resources.clone();
            let reserved = record.reserved;

            if self.config.enable_task_dependencies && !dependencies.is_empty() {
                let tasks = &self.tasks;
                let status_of = |d: &TaskId| tasks.get(d).map(|r| r.task.status);
                if !DependencyResolver::is_ready(&dependencies, status_of) {
                    let unresolved = DependencyResolver::unresolved(&dependencies, status_of);
                    let unsuccessful = unresolved.iter().copied().find(|d| {
                        matches!(status_of(d), Some(TaskStatus::Failed | TaskStatus::Cancelled))
                    });
                    match (self.config.dependency_failure, unsuccessful) {
                        (DependencyFailurePolicy::Propagate, Some(dep)) => {
                            self.fail_task(id, SchedulerError::DependencyFailed(dep).to_string(), events);
                        }
                        _ => {
                            tracing::debug!(task_id = %id, waiting_on = unresolved.len(), "task parked on dependencies");
                            self.resolver.park(id, unresolved);
                        }
                    }
                    continue;
                }
            }

            if !reserved && !resources.is_empty() {
                match self.ledger.allocate_all(id, &resources) {
                    Ok(true) => {
                        if let Some(record) = self.tasks.get_mut(&id) {
                            record.reserved = true;
                        }
                        for req in &resources {
                            events.push(EngineEvent::ResourceAllocated {
                                task_id: id,
                                resource_id: req.resource_id,
                                amount: req.amount,
                            });
                        }
                    }
                    Ok(false) => {
                        tracing::debug!(task_id = %id, "insufficient resource capacity, task parked");
                        self.capacity_waiters.push(id);
                        continue;
                    }
                    Err(e) => {
                        self.fail_task(id, e.to_string(), events);
                        continue;
                    }
                }
            }

            if let Some(start) = self.start(id, events) {
                starts.push(start);
            }
        }
        starts
    }

    fn start(&mut self, id: TaskId, events: &mut Vec<EngineEvent>) -> Option<Start> {
        let default_timeout = self.config.task_timeout();
        self.next_execution += 1;
        let execution = self.next_execution;

        let record = self.tasks.get_mut(&id)?;
        let token = CancellationToken::new();
        record.execution = execution;
        record.cancel = Some(token.clone());
        record.task.status = TaskStatus::Running;
        record.task.started_at_ms = Some(now_ms());
        record.task.progress = None;
        let attempt = record.task.retry_count;
        let timeout = record.task.timeout.unwrap_or(default_timeout);
        let handler = Arc::clone(&record.handler);
        let dependencies = record.task.dependencies.clone();

        self.running.insert(id);
        self.workflows.mark_started(&id);
        let tasks = &self.tasks;
        let dependency_results = DependencyResolver::collect_results(&dependencies, |d| {
            tasks.get(d).and_then(|r| r.task.result.clone())
        });

        tracing::info!(task_id = %id, attempt, running = self.running.len(), "task started");
        events.push(EngineEvent::TaskStarted { task_id: id, attempt });
        Some(Start {
            task_id: id,
            execution,
            attempt,
            handler,
            timeout,
            token,
            dependency_results,
        })
    }

    /// Apply an execution outcome. Returns the retry delay when the task goes back to the queue.
    pub(super) fn finish(
        &mut self,
        id: TaskId,
        execution: u64,
        outcome: Outcome,
        events: &mut Vec<EngineEvent>,
    ) -> Option<Duration> {
        if self.live_record_mut(id, execution).is_none() {
            tracing::debug!(task_id = %id, execution, "discarding stale outcome");
            return None;
        }
        self.running.remove(&id);
        match outcome {
            Outcome::Completed(value) => {
                self.complete(id, value, events);
                None
            }
            Outcome::Failed(error) => self.fail_attempt(id, error, events),
        }
    }

    fn complete(&mut self, id: TaskId, value: Value, events: &mut Vec<EngineEvent>) {
        let Some(record) = self.tasks.get_mut(&id) else {
            return;
        };
        record.task.status = TaskStatus::Completed;
        record.task.completed_at_ms = Some(now_ms());
        record.task.result = Some(value);
        record.task.error = None;
        record.task.progress = Some(100.0);
        record.cancel = None;
        let duration_ms = record.task.execution_time_ms().unwrap_or_default();

        self.metrics.record_completed(duration_ms);
        tracing::info!(task_id = %id, duration_ms = %duration_ms, "task completed");
        events.push(EngineEvent::TaskCompleted { task_id: id, duration_ms });
        self.after_terminal(id, events);

        for ready in self.resolver.resolve(&id) {
            tracing::debug!(task_id = %ready, prerequisite = %id, "dependencies met, task requeued");
            self.enqueue_existing(ready);
        }
    }

    fn fail_attempt(&mut self, id: TaskId, error: String, events: &mut Vec<EngineEvent>) -> Option<Duration> {
        let policy = RetryPolicy::from_config(&self.config);
        let record = self.tasks.get_mut(&id)?;
        match policy.decide(record.task.retry_count, record.task.max_retries) {
            RetryDecision::Retry { attempt, delay } => {
                record.task.retry_count = attempt;
                record.task.status = TaskStatus::Pending;
                record.task.error = Some(error.clone());
                record.task.progress = None;
                record.cancel = None;
                self.metrics.record_retry();
                tracing::warn!(task_id = %id, attempt, error = %error, "task failed, retry scheduled");
                events.push(EngineEvent::TaskRetry {
                    task_id: id,
                    attempt,
                    error,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                });
                Some(delay)
            }
            RetryDecision::Exhausted => {
                self.fail_task(id, error, events);
                None
            }
        }
    }

    /// Move a non-terminal task to `failed`.
    fn fail_task(&mut self, id: TaskId, error: String, events: &mut Vec<EngineEvent>) {
        let Some(record) = self.tasks.get_mut(&id) else {
            return;
        };
        if record.task.status.is_terminal() {
            return;
        }
        let was_running = record.task.status == TaskStatus::Running;
        record.task.status = TaskStatus::Failed;
        record.task.completed_at_ms = Some(now_ms());
        record.task.error = Some(error.clone());
        record.cancel = None;
        let execution_ms = if was_running {
            record.task.execution_time_ms()
        } else {
            None
        };

        self.detach(&id);
        self.metrics.record_failed(execution_ms);
        tracing::error!(task_id = %id, error = %error, "task failed");
        events.push(EngineEvent::TaskFailed { task_id: id, error });
        self.after_terminal(id, events);
        self.propagate_failure(id, events);
    }

    /// Cancel a non-terminal task. Returns `false` for unknown or terminal tasks.
    pub(super) fn cancel(&mut self, id: TaskId, events: &mut Vec<EngineEvent>, propagate: bool) -> bool {
        let Some(record) = self.tasks.get_mut(&id) else {
            return false;
        };
        if record.task.status.is_terminal() {
            return false;
        }
        let was_running = record.task.status == TaskStatus::Running;
        record.task.status = TaskStatus::Cancelled;
        record.task.completed_at_ms = Some(now_ms());
        record.task.error = Some(SchedulerError::Cancelled.to_string());
        if let Some(token) = record.cancel.take() {
            token.cancel();
        }

        self.detach(&id);
        self.metrics.record_cancelled();
        tracing::info!(task_id = %id, was_running, "task cancelled");
        events.push(EngineEvent::TaskCancelled { task_id: id });
        self.after_terminal(id, events);
        if propagate {
            self.propagate_failure(id, events);
        }
        true
    }

    /// Drop every queue, parking lot and slot reference to a task.
    fn detach(&mut self, id: &TaskId) {
        self.running.remove(id);
        self.queue.remove(id);
        self.resolver.unpark(id);
        self.capacity_waiters.retain(|w| w != id);
    }

    /// Release resources and re-evaluate the owning workflow.
    fn after_terminal(&mut self, id: TaskId, events: &mut Vec<EngineEvent>) {
        self.release_resources(id, events);
        let tasks = &self.tasks;
        let transition = self.workflows.on_task_terminal(&id, |t| {
            tasks.get(t).map(|r| (r.task.status, r.task.error.clone()))
        });
        if let Some(transition) = transition {
            push_transition(transition, events);
        }
    }

    fn propagate_failure(&mut self, id: TaskId, events: &mut Vec<EngineEvent>) {
        if self.config.dependency_failure != DependencyFailurePolicy::Propagate
            || !self.config.enable_task_dependencies
        {
            return;
        }
        for dependent in self.resolver.blocked_on(&id) {
            self.resolver.unpark(&dependent);
            self.fail_task(dependent, SchedulerError::DependencyFailed(id).to_string(), events);
        }
    }

    fn release_resources(&mut self, id: TaskId, events: &mut Vec<EngineEvent>) {
        let released = self.ledger.release_all(&id);
        if released.is_empty() {
            return;
        }
        for alloc in released {
            tracing::debug!(task_id = %id, resource_id = %alloc.resource_id, amount = alloc.amount, "resource released");
            events.push(EngineEvent::ResourceReleased {
                task_id: alloc.task_id,
                resource_id: alloc.resource_id,
                amount: alloc.amount,
            });
        }
        for waiter in std::mem::take(&mut self.capacity_waiters) {
            self.enqueue_existing(waiter);
        }
    }

    /// Put a known pending task back in the queue, keeping its original sequence number.
    fn enqueue_existing(&mut self, id: TaskId) -> bool {
        let Some(record) = self.tasks.get(&id) else {
            return false;
        };
        if record.task.status != TaskStatus::Pending
            || self.queue.contains(&id)
            || self.resolver.is_parked(&id)
        {
            return false;
        }
        self.queue.push(record.entry());
        true
    }

    /// Retry delay elapsed.
    pub(super) fn requeue(&mut self, id: TaskId) -> bool {
        self.enqueue_existing(id)
    }

    /// Cancel every pending task. Returns how many were cancelled.
    pub(super) fn clear_pending(&mut self, events: &mut Vec<EngineEvent>) -> usize {
        let mut pending: Vec<(u64, TaskId)> = self
            .tasks
            .values()
            .filter(|r| r.task.status == TaskStatus::Pending)
            .map(|r| (r.seq, r.task.id))
            .collect();
        pending.sort_unstable();

        self.queue.clear();
        self.resolver.drain();
        self.capacity_waiters.clear();

        let mut count = 0;
        for (_, id) in pending {
            if self.cancel(id, events, false) {
                count += 1;
            }
        }
        tracing::info!(count, "queue cleared");
        events.push(EngineEvent::QueueCleared { count });
        count
    }

    /// Remove terminal tasks that finished at least `older_than` ago.
    ///
    /// Members of a live workflow and prerequisites of a live task are kept:
    /// both still read the record's status and result.
    pub(super) fn purge_terminal(&mut self, older_than: Duration) -> usize {
        let cutoff = now_ms().saturating_sub(older_than.as_millis());
        let still_needed: HashSet<TaskId> = self
            .tasks
            .values()
            .filter(|r| !r.task.status.is_terminal())
            .flat_map(|r| r.task.dependencies.iter().copied())
            .collect();
        let stale: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|r| {
                r.task.status.is_terminal() && r.task.completed_at_ms.is_some_and(|t| t <= cutoff)
            })
            .filter(|r| !still_needed.contains(&r.task.id))
            .filter(|r| {
                r.task
                    .workflow_id
                    .and_then(|wf| self.workflows.status(&wf))
                    .is_none_or(WorkflowStatus::is_terminal)
            })
            .map(|r| r.task.id)
            .collect();
        for id in &stale {
            self.tasks.remove(id);
            self.ledger.forget(id);
            self.workflows.forget_task(id);
        }
        stale.len()
    }

    /// Swap in a validated configuration.
    pub(super) fn apply_config(&mut self, next: EngineConfig, events: &mut Vec<EngineEvent>) {
        if next.enable_priority_queue != self.queue.priority_ordering() {
            self.queue.set_priority_ordering(next.enable_priority_queue);
        }
        let gating_switched_off = self.config.enable_task_dependencies && !next.enable_task_dependencies;
        self.metrics.resize(next.metrics_window);
        self.config = next.clone();
        if gating_switched_off {
            for id in self.resolver.drain() {
                self.enqueue_existing(id);
            }
        }
        tracing::info!(
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            priority_queue = self.config.enable_priority_queue,
            "configuration updated"
        );
        events.push(EngineEvent::ConfigUpdated { config: next });
    }

    /// Record of a task that is still running the given execution.
    pub(super) fn live_record_mut(&mut self, id: TaskId, execution: u64) -> Option<&mut Task> {
        self.tasks
            .get_mut(&id)
            .filter(|r| r.task.status == TaskStatus::Running && r.execution == execution)
            .map(|r| &mut r.task)
    }

    pub(super) fn task(&self, id: &TaskId) -> Option<Task> {
        self.tasks.get(id).map(|r| r.task.clone())
    }

    pub(super) fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    /// Queued tasks in dequeue order, then other pending tasks in submission order.
    pub(super) fn pending_tasks(&self) -> Vec<Task> {
        let queued = self.queue.ordered();
        let mut out: Vec<Task> = queued
            .iter()
            .filter_map(|e| self.tasks.get(&e.task_id))
            .map(|r| r.task.clone())
            .collect();
        let mut waiting: Vec<&TaskRecord> = self
            .tasks
            .values()
            .filter(|r| r.task.status == TaskStatus::Pending && !self.queue.contains(&r.task.id))
            .collect();
        waiting.sort_by_key(|r| r.seq);
        out.extend(waiting.into_iter().map(|r| r.task.clone()));
        out
    }

    pub(super) fn running_tasks(&self) -> Vec<Task> {
        let mut out: Vec<Task> = self
            .running
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .map(|r| r.task.clone())
            .collect();
        out.sort_by_key(|t| t.started_at_ms);
        out
    }

    /// Most recently completed first.
    pub(super) fn completed_tasks(&self, limit: usize) -> Vec<Task> {
        let mut out: Vec<Task> = self
            .tasks
            .values()
            .filter(|r| r.task.status == TaskStatus::Completed)
            .map(|r| r.task.clone())
            .collect();
        out.sort_by(|a, b| b.completed_at_ms.cmp(&a.completed_at_ms));
        out.truncate(limit);
        out
    }

    pub(super) fn metrics(&self) -> SchedulerMetrics {
        let pending = self
            .tasks
            .values()
            .filter(|r| r.task.status == TaskStatus::Pending)
            .count();
        self.metrics
            .snapshot(pending, self.running.len(), self.ledger.utilization())
    }
}

pub(super) fn push_transition(transition: WorkflowTransition, events: &mut Vec<EngineEvent>) {
    match transition {
        WorkflowTransition::Completed(workflow_id) => {
            tracing::info!(workflow_id = %workflow_id, "workflow completed");
            events.push(EngineEvent::WorkflowCompleted { workflow_id });
        }
        WorkflowTransition::Failed {
            workflow_id,
            task_id,
            error,
        } => {
            tracing::warn!(workflow_id = %workflow_id, task_id = %task_id, "workflow failed");
            events.push(EngineEvent::WorkflowFailed {
                workflow_id,
                task_id,
                error,
            });
        }
    }
}
