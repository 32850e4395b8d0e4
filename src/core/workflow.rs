//! Workflow tracking: aggregate status derived from member tasks.

use std::collections::HashMap;

use crate::core::task::{TaskStatus, Workflow, WorkflowStatus};
use crate::util::clock::now_ms;
use crate::util::serde::{TaskId, WorkflowId};

/// Terminal transition produced by an evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowTransition {
    /// Every member completed.
    Completed(WorkflowId),
    /// A member failed.
    Failed {
        /// Workflow that failed.
        workflow_id: WorkflowId,
        /// First failed member found.
        task_id: TaskId,
        /// That member's error.
        error: Option<String>,
    },
}

/// Owns workflow records and task membership.
#[derive(Debug, Default)]
pub struct WorkflowTracker {
    workflows: HashMap<WorkflowId, Workflow>,
    membership: HashMap<TaskId, WorkflowId>,
}

impl WorkflowTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new `pending` workflow over `task_ids`.
    pub fn register(&mut self, id: WorkflowId, name: String, task_ids: Vec<TaskId>) -> Workflow {
        for task_id in &task_ids {
            self.membership.insert(*task_id, id);
        }
        let workflow = Workflow {
            id,
            name,
            task_ids,
            status: WorkflowStatus::Pending,
            created_at_ms: now_ms(),
            started_at_ms: None,
            completed_at_ms: None,
            error: None,
        };
        self.workflows.insert(id, workflow.clone());
        workflow
    }

    /// Workflow snapshot.
    #[must_use]
    pub fn get(&self, id: &WorkflowId) -> Option<Workflow> {
        self.workflows.get(id).cloned()
    }

    /// Status of a workflow.
    #[must_use]
    pub fn status(&self, id: &WorkflowId) -> Option<WorkflowStatus> {
        self.workflows.get(id).map(|w| w.status)
    }

    /// Workflow a task belongs to.
    #[must_use]
    pub fn workflow_of(&self, task_id: &TaskId) -> Option<WorkflowId> {
        self.membership.get(task_id).copied()
    }

    /// A member started: a `pending` workflow becomes `running`.
    pub fn mark_started(&mut self, task_id: &TaskId) {
        let Some(wf) = self
            .membership
            .get(task_id)
            .and_then(|id| self.workflows.get_mut(id))
        else {
            return;
        };
        if wf.status == WorkflowStatus::Pending {
            wf.status = WorkflowStatus::Running;
            wf.started_at_ms = Some(now_ms());
        }
    }

    /// Re-evaluate the workflow containing `task_id` after a member's terminal transition.
    pub fn on_task_terminal<F>(&mut self, task_id: &TaskId, status_of: F) -> Option<WorkflowTransition>
    where
        F: Fn(&TaskId) -> Option<(TaskStatus, Option<String>)>,
    {
        let workflow_id = self.workflow_of(task_id)?;
        self.evaluate(&workflow_id, status_of)
    }

    /// Derive the workflow status from its members.
    ///
    /// A terminal workflow is never changed again, so repeated evaluations
    /// yield at most one transition.
    pub fn evaluate<F>(&mut self, workflow_id: &WorkflowId, status_of: F) -> Option<WorkflowTransition>
    where
        F: Fn(&TaskId) -> Option<(TaskStatus, Option<String>)>,
    {
        let wf = self.workflows.get_mut(workflow_id)?;
        if wf.status.is_terminal() {
            return None;
        }

        let failed = wf.task_ids.iter().find_map(|id| match status_of(id) {
            Some((TaskStatus::Failed, error)) => Some((*id, error)),
            _ => None,
        });
        if let Some((task_id, error)) = failed {
            wf.status = WorkflowStatus::Failed;
            wf.completed_at_ms = Some(now_ms());
            wf.error.clone_from(&error);
            return Some(WorkflowTransition::Failed {
                workflow_id: *workflow_id,
                task_id,
                error,
            });
        }

        let all_completed = wf
            .task_ids
            .iter()
            .all(|id| matches!(status_of(id), Some((TaskStatus::Completed, _))));
        if all_completed {
            wf.status = WorkflowStatus::Completed;
            wf.completed_at_ms = Some(now_ms());
            return Some(WorkflowTransition::Completed(*workflow_id));
        }
        None
    }

    /// Mark a non-terminal workflow `cancelled`, returning its members.
    ///
    /// Returns `None` for unknown or already terminal workflows.
    pub fn cancel(&mut self, workflow_id: &WorkflowId) -> Option<Vec<TaskId>> {
        let wf = self.workflows.get_mut(workflow_id)?;
        if wf.status.is_terminal() {
            return None;
        }
        wf.status = WorkflowStatus::Cancelled;
        wf.completed_at_ms = Some(now_ms());
        Some(wf.task_ids.clone())
    }

    /// Forget a task's membership (its record was purged).
    pub fn forget_task(&mut self, task_id: &TaskId) {
        self.membership.remove(task_id);
    }

    /// All workflows.
    #[must_use]
    pub fn workflows(&self) -> Vec<Workflow> {
        self.workflows.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Statuses = HashMap<TaskId, (TaskStatus, Option<String>)>;

    fn setup(n: usize) -> (WorkflowTracker, WorkflowId, Vec<TaskId>, Statuses) {
        let mut tracker = WorkflowTracker::new();
        let ids: Vec<TaskId> = (0..n).map(|_| TaskId::new()).collect();
        let wf = WorkflowId::new();
        tracker.register(wf, "wf".into(), ids.clone());
        let statuses = ids.iter().map(|id| (*id, (TaskStatus::Pending, None))).collect();
        (tracker, wf, ids, statuses)
    }

    #[test]
    fn test_completes_only_after_all_members() {
        let (mut tracker, wf, ids, mut statuses) = setup(3);
        tracker.mark_started(&ids[0]);
        assert_eq!(tracker.status(&wf), Some(WorkflowStatus::Running));

        for (i, id) in ids.iter().enumerate() {
            statuses.insert(*id, (TaskStatus::Completed, None));
            let t = tracker.on_task_terminal(id, |x| statuses.get(x).cloned());
            if i < 2 {
                assert!(t.is_none());
                assert_eq!(tracker.status(&wf), Some(WorkflowStatus::Running));
            } else {
                assert_eq!(t, Some(WorkflowTransition::Completed(wf)));
            }
        }
        assert_eq!(tracker.status(&wf), Some(WorkflowStatus::Completed));
    }

    #[test]
    fn test_fails_while_others_pending() {
        let (mut tracker, wf, ids, mut statuses) = setup(3);
        statuses.insert(ids[1], (TaskStatus::Failed, Some("boom".into())));

        let t = tracker.on_task_terminal(&ids[1], |x| statuses.get(x).cloned());
        assert_eq!(
            t,
            Some(WorkflowTransition::Failed {
                workflow_id: wf,
                task_id: ids[1],
                error: Some("boom".into()),
            })
        );
        let snapshot = tracker.get(&wf).unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_redelivered_completion_is_idempotent() {
        let (mut tracker, wf, ids, mut statuses) = setup(1);
        statuses.insert(ids[0], (TaskStatus::Completed, None));
        assert!(tracker.on_task_terminal(&ids[0], |x| statuses.get(x).cloned()).is_some());
        let finished_at = tracker.get(&wf).unwrap().completed_at_ms;

        assert!(tracker.on_task_terminal(&ids[0], |x| statuses.get(x).cloned()).is_none());
        let again = tracker.get(&wf).unwrap();
        assert_eq!(again.status, WorkflowStatus::Completed);
        assert_eq!(again.completed_at_ms, finished_at);
    }

    #[test]
    fn test_cancel_is_terminal() {
        let (mut tracker, wf, ids, mut statuses) = setup(2);
        assert_eq!(tracker.cancel(&wf), Some(ids.clone()));
        assert!(tracker.cancel(&wf).is_none());

        for id in &ids {
            statuses.insert(*id, (TaskStatus::Completed, None));
        }
        assert!(tracker.evaluate(&wf, |x| statuses.get(x).cloned()).is_none());
        assert_eq!(tracker.status(&wf), Some(WorkflowStatus::Cancelled));
    }
}
