//! Dependency gating.
//!
//! Tasks whose prerequisites are not all `completed` are parked against the
//! prerequisites they still wait on. When a prerequisite completes, the
//! resolver hands back exactly the dependents that became ready, so the
//! scheduler never rescans blocked tasks.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::core::task::TaskStatus;
use crate::util::serde::TaskId;

/// Tracks parked tasks and the prerequisites they wait on.
#[derive(Debug, Default)]
pub struct DependencyResolver {
    /// dependent -> prerequisites not yet completed
    waiting_on: HashMap<TaskId, HashSet<TaskId>>,
    /// prerequisite -> parked dependents, in park order
    dependents: HashMap<TaskId, Vec<TaskId>>,
}

impl DependencyResolver {
    /// Create an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff every prerequisite is known and `completed`.
    pub fn is_ready<F>(dependencies: &[TaskId], status_of: F) -> bool
    where
        F: Fn(&TaskId) -> Option<TaskStatus>,
    {
        dependencies
            .iter()
            .all(|dep| status_of(dep) == Some(TaskStatus::Completed))
    }

    /// Prerequisites that are not `completed` (unknown ones included).
    pub fn unresolved<F>(dependencies: &[TaskId], status_of: F) -> Vec<TaskId>
    where
        F: Fn(&TaskId) -> Option<TaskStatus>,
    {
        dependencies
            .iter()
            .filter(|dep| status_of(dep) != Some(TaskStatus::Completed))
            .copied()
            .collect()
    }

    /// Results of completed prerequisites, for the dependent's handler.
    pub fn collect_results<F>(dependencies: &[TaskId], result_of: F) -> HashMap<TaskId, Value>
    where
        F: Fn(&TaskId) -> Option<Value>,
    {
        dependencies
            .iter()
            .filter_map(|dep| result_of(dep).map(|v| (*dep, v)))
            .collect()
    }

    /// Whether adding `task_id` with these prerequisites closes a cycle.
    pub fn would_cycle<F>(task_id: TaskId, dependencies: &[TaskId], dependencies_of: F) -> bool
    where
        F: Fn(&TaskId) -> Option<Vec<TaskId>>,
    {
        let mut stack: Vec<TaskId> = dependencies.to_vec();
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == task_id {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(next) = dependencies_of(&current) {
                stack.extend(next);
            }
        }
        false
    }

    /// Park a task until each of `unresolved` completes.
    pub fn park(&mut self, task_id: TaskId, unresolved: impl IntoIterator<Item = TaskId>) {
        let waiting = self.waiting_on.entry(task_id).or_default();
        for dep in unresolved {
            if waiting.insert(dep) {
                self.dependents.entry(dep).or_default().push(task_id);
            }
        }
        if waiting.is_empty() {
            self.waiting_on.remove(&task_id);
        }
    }

    /// A prerequisite completed: returns dependents that are now ready, in park order.
    pub fn resolve(&mut self, prerequisite: &TaskId) -> Vec<TaskId> {
        let Some(waiters) = self.dependents.remove(prerequisite) else {
            return Vec::new();
        };
        let mut ready = Vec::new();
        for dependent in waiters {
            if let Some(waiting) = self.waiting_on.get_mut(&dependent) {
                waiting.remove(prerequisite);
                if waiting.is_empty() {
                    self.waiting_on.remove(&dependent);
                    ready.push(dependent);
                }
            }
        }
        ready
    }

    /// Dependents currently parked on `prerequisite`.
    #[must_use]
    pub fn blocked_on(&self, prerequisite: &TaskId) -> Vec<TaskId> {
        self.dependents
            .get(prerequisite)
            .map(|waiters| {
                waiters
                    .iter()
                    .filter(|d| self.waiting_on.contains_key(d))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove a parked task (cancelled or failed). Returns whether it was parked.
    pub fn unpark(&mut self, task_id: &TaskId) -> bool {
        let Some(waiting) = self.waiting_on.remove(task_id) else {
            return false;
        };
        for dep in waiting {
            if let Some(waiters) = self.dependents.get_mut(&dep) {
                waiters.retain(|d| d != task_id);
                if waiters.is_empty() {
                    self.dependents.remove(&dep);
                }
            }
        }
        true
    }

    /// Release every parked task, e.g. when dependency gating is switched off.
    pub fn drain(&mut self) -> Vec<TaskId> {
        self.dependents.clear();
        self.waiting_on.drain().map(|(id, _)| id).collect()
    }

    /// Whether the task is parked.
    #[must_use]
    pub fn is_parked(&self, task_id: &TaskId) -> bool {
        self.waiting_on.contains_key(task_id)
    }

    /// Number of parked tasks.
    #[must_use]
    pub fn parked_count(&self) -> usize {
        self.waiting_on.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ready_requires_completed() {
        let a = TaskId::new();
        let b = TaskId::new();
        let statuses: HashMap<TaskId, TaskStatus> =
            [(a, TaskStatus::Completed), (b, TaskStatus::Failed)].into();
        let lookup = |id: &TaskId| statuses.get(id).copied();

        assert!(DependencyResolver::is_ready(&[], lookup));
        assert!(DependencyResolver::is_ready(&[a], lookup));
        assert!(!DependencyResolver::is_ready(&[a, b], lookup));
        assert!(!DependencyResolver::is_ready(&[TaskId::new()], lookup));
        assert_eq!(DependencyResolver::unresolved(&[a, b], lookup), vec![b]);
    }

    #[test]
    fn test_resolve_wakes_only_fully_ready_dependents() {
        let a = TaskId::new();
        let b = TaskId::new();
        let only_a = TaskId::new();
        let both = TaskId::new();

        let mut resolver = DependencyResolver::new();
        resolver.park(only_a, [a]);
        resolver.park(both, [a, b]);
        assert_eq!(resolver.parked_count(), 2);

        assert_eq!(resolver.resolve(&a), vec![only_a]);
        assert!(resolver.is_parked(&both));
        assert_eq!(resolver.resolve(&b), vec![both]);
        assert_eq!(resolver.parked_count(), 0);
        assert!(resolver.resolve(&a).is_empty());
    }

    #[test]
    fn test_unpark_and_blocked_on() {
        let a = TaskId::new();
        let x = TaskId::new();
        let y = TaskId::new();
        let mut resolver = DependencyResolver::new();
        resolver.park(x, [a]);
        resolver.park(y, [a]);

        assert_eq!(resolver.blocked_on(&a), vec![x, y]);
        assert!(resolver.unpark(&x));
        assert!(!resolver.unpark(&x));
        assert_eq!(resolver.blocked_on(&a), vec![y]);
        assert_eq!(resolver.resolve(&a), vec![y]);
    }

    #[test]
    fn test_would_cycle() {
        let a = TaskId::new();
        let b = TaskId::new();
        let c = TaskId::new();
        let graph: HashMap<TaskId, Vec<TaskId>> = [(a, vec![b]), (b, vec![])].into();
        let lookup = |id: &TaskId| graph.get(id).cloned();

        // c -> a -> b: fine
        assert!(!DependencyResolver::would_cycle(c, &[a], lookup));
        // b -> a -> b: cycle
        assert!(DependencyResolver::would_cycle(b, &[a], lookup));
    }

    #[test]
    fn test_collect_results_skips_missing() {
        let a = TaskId::new();
        let b = TaskId::new();
        let results = DependencyResolver::collect_results(&[a, b], |id| {
            (*id == a).then(|| serde_json::json!("done"))
        });
        assert_eq!(results.len(), 1);
        assert_eq!(results[&a], serde_json::json!("done"));
    }
}
