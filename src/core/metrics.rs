//! Rolling execution metrics. Read-only for callers; never consulted by the scheduler.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    /// Tasks ever submitted.
    pub total_tasks: u64,
    /// Tasks currently pending.
    pub pending_tasks: usize,
    /// Tasks currently running.
    pub running_tasks: usize,
    /// Tasks that completed.
    pub completed_tasks: u64,
    /// Tasks that failed after exhausting retries.
    pub failed_tasks: u64,
    /// Tasks that were cancelled.
    pub cancelled_tasks: u64,
    /// Retry attempts scheduled.
    pub retried_tasks: u64,
    /// Moving average of execution time over the sample window.
    pub average_execution_time_ms: f64,
    /// completed / (completed + failed); 1.0 before any outcome.
    pub success_rate: f64,
    /// Fraction of registered resource capacity in use.
    pub resource_utilization: f64,
}

/// Collects execution samples and outcome counters.
#[derive(Debug)]
pub struct MetricsCollector {
    window: VecDeque<u128>,
    window_size: usize,
    total: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    retried: u64,
}

impl MetricsCollector {
    /// Create a collector keeping the last `window_size` samples.
    #[must_use]
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
            total: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            retried: 0,
        }
    }

    /// A task was submitted.
    pub fn record_submitted(&mut self) {
        self.total += 1;
    }

    /// A task completed after `execution_ms`.
    pub fn record_completed(&mut self, execution_ms: u128) {
        self.completed += 1;
        self.push_sample(execution_ms);
    }

    /// A task failed for good.
    pub fn record_failed(&mut self, execution_ms: Option<u128>) {
        self.failed += 1;
        if let Some(ms) = execution_ms {
            self.push_sample(ms);
        }
    }

    /// A task was cancelled.
    pub fn record_cancelled(&mut self) {
        self.cancelled += 1;
    }

    /// A retry was scheduled.
    pub fn record_retry(&mut self) {
        self.retried += 1;
    }

    /// Change the window size, dropping the oldest samples if it shrinks.
    pub fn resize(&mut self, window_size: usize) {
        self.window_size = window_size.max(1);
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }
    }

    fn push_sample(&mut self, ms: u128) {
        if self.window.len() >= self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(ms);
    }

    /// Moving average over the window, 0.0 when empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average_execution_ms(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let sum: u128 = self.window.iter().sum();
        sum as f64 / self.window.len() as f64
    }

    /// completed / (completed + failed); 1.0 before any outcome.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            1.0
        } else {
            self.completed as f64 / finished as f64
        }
    }

    /// Snapshot; queue and resource figures are filled in by the scheduler.
    #[must_use]
    pub fn snapshot(&self, pending: usize, running: usize, utilization: f64) -> SchedulerMetrics {
        SchedulerMetrics {
            total_tasks: self.total,
            pending_tasks: pending,
            running_tasks: running,
            completed_tasks: self.completed,
            failed_tasks: self.failed,
            cancelled_tasks: self.cancelled,
            retried_tasks: self.retried,
            average_execution_time_ms: self.average_execution_ms(),
            success_rate: self.success_rate(),
            resource_utilization: utilization,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moving_average_window() {
        let mut m = MetricsCollector::new(3);
        for ms in [10, 20, 30, 100] {
            m.record_completed(ms);
        }
        // 10 fell out of the window
        assert!((m.average_execution_ms() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_success_rate() {
        let mut m = MetricsCollector::new(100);
        assert!((m.success_rate() - 1.0).abs() < f64::EPSILON);
        m.record_completed(5);
        m.record_completed(5);
        m.record_completed(5);
        m.record_failed(None);
        assert!((m.success_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_counters() {
        let mut m = MetricsCollector::new(10);
        m.record_submitted();
        m.record_submitted();
        m.record_retry();
        m.record_cancelled();
        let s = m.snapshot(1, 0, 0.25);
        assert_eq!(s.total_tasks, 2);
        assert_eq!(s.retried_tasks, 1);
        assert_eq!(s.cancelled_tasks, 1);
        assert_eq!(s.pending_tasks, 1);
        assert!((s.resource_utilization - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_resize_drops_oldest() {
        let mut m = MetricsCollector::new(4);
        for ms in [1, 2, 3, 4] {
            m.record_completed(ms);
        }
        m.resize(2);
        assert!((m.average_execution_ms() - 3.5).abs() < f64::EPSILON);
    }
}
