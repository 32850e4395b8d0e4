//! Resource ledger: named finite pools and per-task allocations.
//!
//! Every mutation keeps `used + available == capacity`. Allocation failure is
//! a normal outcome (`Ok(false)`), not an error.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::task::ResourceRequest;
use crate::core::SchedulerError;
use crate::util::clock::now_ms;
use crate::util::serde::{ResourceId, ResourceKind, TaskId};

/// Registration request for a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Display name.
    pub name: String,
    /// Resource kind.
    #[serde(default)]
    pub kind: ResourceKind,
    /// Total units.
    pub capacity: u64,
}

impl ResourceSpec {
    /// Create a spec.
    pub fn new(name: impl Into<String>, kind: ResourceKind, capacity: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            capacity,
        }
    }
}

/// Snapshot of a registered resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique identity.
    pub id: ResourceId,
    /// Display name.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Total units.
    pub capacity: u64,
    /// Units held by tasks.
    pub used: u64,
    /// Units free.
    pub available: u64,
}

/// One reservation made by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    /// Owning task.
    pub task_id: TaskId,
    /// Resource drawn from.
    pub resource_id: ResourceId,
    /// Units reserved.
    pub amount: u64,
    /// Allocation time (ms since epoch).
    pub allocated_at_ms: u128,
    /// Release time (ms since epoch); `None` while held.
    pub released_at_ms: Option<u128>,
}

/// Owns resources and allocations.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    resources: HashMap<ResourceId, Resource>,
    allocations: HashMap<TaskId, Vec<ResourceAllocation>>,
}

impl ResourceLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource with `used = 0, available = capacity`.
    ///
    /// # Errors
    ///
    /// `Validation` for an empty name or zero capacity.
    pub fn register(&mut self, spec: ResourceSpec) -> Result<Resource, SchedulerError> {
        if spec.name.trim().is_empty() {
            return Err(SchedulerError::Validation("resource name is required".into()));
        }
        if spec.capacity == 0 {
            return Err(SchedulerError::Validation(format!(
                "resource `{}` capacity must be greater than 0",
                spec.name
            )));
        }
        let resource = Resource {
            id: ResourceId::new(),
            name: spec.name,
            kind: spec.kind,
            capacity: spec.capacity,
            used: 0,
            available: spec.capacity,
        };
        self.resources.insert(resource.id, resource.clone());
        Ok(resource)
    }

    /// Reserve `amount` units for `task_id`.
    ///
    /// Returns `Ok(false)` without side effects when `amount > available`.
    ///
    /// # Errors
    ///
    /// `ResourceNotFound` for an unknown resource, `Validation` for a zero amount.
    pub fn allocate(
        &mut self,
        task_id: TaskId,
        resource_id: ResourceId,
        amount: u64,
    ) -> Result<bool, SchedulerError> {
        if amount == 0 {
            return Err(SchedulerError::Validation("allocation amount must be greater than 0".into()));
        }
        let resource = self
            .resources
            .get_mut(&resource_id)
            .ok_or(SchedulerError::ResourceNotFound(resource_id))?;
        if amount > resource.available {
            return Ok(false);
        }
        resource.available -= amount;
        resource.used += amount;
        debug_assert_eq!(resource.used + resource.available, resource.capacity);
        self.allocations
            .entry(task_id)
            .or_default()
            .push(ResourceAllocation {
                task_id,
                resource_id,
                amount,
                allocated_at_ms: now_ms(),
                released_at_ms: None,
            });
        Ok(true)
    }

    /// Reserve every request or none of them.
    ///
    /// # Errors
    ///
    /// `ResourceNotFound` for an unknown resource, `Validation` for a zero amount.
    pub fn allocate_all(
        &mut self,
        task_id: TaskId,
        requests: &[ResourceRequest],
    ) -> Result<bool, SchedulerError> {
        let mut wanted: HashMap<ResourceId, u64> = HashMap::new();
        for req in requests {
            self.check_request(req)?;
            *wanted.entry(req.resource_id).or_default() += req.amount;
        }
        let fits = wanted.iter().all(|(id, amount)| {
            self.resources
                .get(id)
                .is_some_and(|r| *amount <= r.available)
        });
        if !fits {
            return Ok(false);
        }
        for req in requests {
            self.allocate(task_id, req.resource_id, req.amount)?;
        }
        Ok(true)
    }

    /// Validate a request against the registered resources without reserving.
    ///
    /// # Errors
    ///
    /// `ResourceNotFound`, or `Validation` for a zero amount or an amount that
    /// can never fit.
    pub fn check_request(&self, req: &ResourceRequest) -> Result<(), SchedulerError> {
        let resource = self
            .resources
            .get(&req.resource_id)
            .ok_or(SchedulerError::ResourceNotFound(req.resource_id))?;
        if req.amount == 0 {
            return Err(SchedulerError::Validation("allocation amount must be greater than 0".into()));
        }
        if req.amount > resource.capacity {
            return Err(SchedulerError::Validation(format!(
                "requested {} units of `{}` but capacity is {}",
                req.amount, resource.name, resource.capacity
            )));
        }
        Ok(())
    }

    /// Release every outstanding allocation of `task_id`. A second call is a no-op.
    ///
    /// Returns the allocations released by this call.
    pub fn release_all(&mut self, task_id: &TaskId) -> Vec<ResourceAllocation> {
        let Some(allocations) = self.allocations.get_mut(task_id) else {
            return Vec::new();
        };
        let now = now_ms();
        let mut released = Vec::new();
        for alloc in allocations.iter_mut().filter(|a| a.released_at_ms.is_none()) {
            if let Some(resource) = self.resources.get_mut(&alloc.resource_id) {
                resource.used -= alloc.amount;
                resource.available += alloc.amount;
                debug_assert_eq!(resource.used + resource.available, resource.capacity);
            }
            alloc.released_at_ms = Some(now);
            released.push(alloc.clone());
        }
        released
    }

    /// Drop the allocation history of a task whose allocations are all released.
    pub fn forget(&mut self, task_id: &TaskId) {
        if self
            .allocations
            .get(task_id)
            .is_some_and(|a| a.iter().all(|x| x.released_at_ms.is_some()))
        {
            self.allocations.remove(task_id);
        }
    }

    /// Resource snapshot.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<Resource> {
        self.resources.get(id).cloned()
    }

    /// All resources.
    #[must_use]
    pub fn resources(&self) -> Vec<Resource> {
        self.resources.values().cloned().collect()
    }

    /// Allocation history of a task, including released entries.
    #[must_use]
    pub fn allocations_for(&self, task_id: &TaskId) -> Vec<ResourceAllocation> {
        self.allocations.get(task_id).cloned().unwrap_or_default()
    }

    /// Fraction of total capacity in use across all resources, 0.0–1.0.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        let (used, capacity) = self
            .resources
            .values()
            .fold((0u64, 0u64), |(u, c), r| (u + r.used, c + r.capacity));
        if capacity == 0 {
            0.0
        } else {
            used as f64 / capacity as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(capacity: u64) -> (ResourceLedger, ResourceId) {
        let mut ledger = ResourceLedger::new();
        let r = ledger
            .register(ResourceSpec::new("gpu", ResourceKind::GpuVram, capacity))
            .unwrap();
        (ledger, r.id)
    }

    fn assert_invariant(ledger: &ResourceLedger) {
        for r in ledger.resources() {
            assert_eq!(r.used + r.available, r.capacity, "ledger invariant broken for {}", r.name);
        }
    }

    #[test]
    fn test_register_starts_empty() {
        let (ledger, id) = ledger_with(100);
        let r = ledger.get(&id).unwrap();
        assert_eq!((r.used, r.available, r.capacity), (0, 100, 100));
    }

    #[test]
    fn test_register_rejects_zero_capacity() {
        let mut ledger = ResourceLedger::new();
        let err = ledger
            .register(ResourceSpec::new("x", ResourceKind::Cpu, 0))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
    }

    #[test]
    fn test_allocate_and_release() {
        let (mut ledger, id) = ledger_with(100);
        let task = TaskId::new();

        assert!(ledger.allocate(task, id, 60).unwrap());
        assert_invariant(&ledger);
        assert_eq!(ledger.get(&id).unwrap().available, 40);

        // Over-ask fails without side effects.
        let other = TaskId::new();
        assert!(!ledger.allocate(other, id, 50).unwrap());
        assert_eq!(ledger.get(&id).unwrap().available, 40);
        assert!(ledger.allocations_for(&other).is_empty());

        let released = ledger.release_all(&task);
        assert_eq!(released.len(), 1);
        assert!(released[0].released_at_ms.is_some());
        assert_eq!(ledger.get(&id).unwrap().available, 100);
        assert_invariant(&ledger);

        // Second release is a no-op.
        assert!(ledger.release_all(&task).is_empty());
        assert_eq!(ledger.get(&id).unwrap().used, 0);
    }

    #[test]
    fn test_allocate_unknown_resource() {
        let mut ledger = ResourceLedger::new();
        let missing = ResourceId::new();
        assert_eq!(
            ledger.allocate(TaskId::new(), missing, 1),
            Err(SchedulerError::ResourceNotFound(missing))
        );
    }

    #[test]
    fn test_allocate_all_is_atomic() {
        let mut ledger = ResourceLedger::new();
        let cpu = ledger
            .register(ResourceSpec::new("cpu", ResourceKind::Cpu, 4))
            .unwrap()
            .id;
        let mem = ledger
            .register(ResourceSpec::new("mem", ResourceKind::Memory, 10))
            .unwrap()
            .id;
        let task = TaskId::new();
        let requests = [
            ResourceRequest { resource_id: cpu, amount: 2 },
            ResourceRequest { resource_id: mem, amount: 6 },
            ResourceRequest { resource_id: mem, amount: 5 },
        ];

        // 6 + 5 memory does not fit in 10: nothing is reserved.
        assert!(!ledger.allocate_all(task, &requests).unwrap());
        assert_eq!(ledger.get(&cpu).unwrap().available, 4);
        assert_eq!(ledger.get(&mem).unwrap().available, 10);

        assert!(ledger.allocate_all(task, &requests[..2]).unwrap());
        assert_eq!(ledger.get(&cpu).unwrap().available, 2);
        assert_eq!(ledger.get(&mem).unwrap().available, 4);
        assert_invariant(&ledger);
    }

    #[test]
    fn test_check_request_rejects_impossible_amounts() {
        let (ledger, id) = ledger_with(10);
        let req = ResourceRequest { resource_id: id, amount: 11 };
        assert!(matches!(ledger.check_request(&req), Err(SchedulerError::Validation(_))));
    }

    #[test]
    fn test_utilization_and_forget() {
        let (mut ledger, id) = ledger_with(10);
        let task = TaskId::new();
        ledger.allocate(task, id, 5).unwrap();
        assert!((ledger.utilization() - 0.5).abs() < f64::EPSILON);

        ledger.forget(&task);
        assert_eq!(ledger.allocations_for(&task).len(), 1);
        ledger.release_all(&task);
        ledger.forget(&task);
        assert!(ledger.allocations_for(&task).is_empty());
    }
}
