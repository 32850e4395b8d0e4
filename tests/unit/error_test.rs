//! Tests for error types

use prometheus_task_engine::core::SchedulerError;
use prometheus_task_engine::util::TaskId;

#[test]
fn test_queue_full_error() {
    let err = SchedulerError::QueueFull("1000 tasks pending".to_string());
    assert_eq!(format!("{}", err), "queue full: 1000 tasks pending");
}

#[test]
fn test_scheduler_disabled_error() {
    let err = SchedulerError::SchedulerDisabled;
    assert_eq!(format!("{}", err), "scheduler is paused");
}

#[test]
fn test_timeout_error() {
    let err = SchedulerError::Timeout(250);
    assert_eq!(format!("{}", err), "task timed out after 250ms");
}

#[test]
fn test_not_found_errors_carry_id() {
    let id = TaskId::new();
    let err = SchedulerError::TaskNotFound(id);
    assert_eq!(format!("{}", err), format!("task not found: {id}"));
}

#[test]
fn test_feature_disabled_error() {
    let err = SchedulerError::FeatureDisabled("workflows");
    assert_eq!(format!("{}", err), "workflows is disabled");
}

#[test]
fn test_errors_convert_into_anyhow() {
    let err: anyhow::Error = SchedulerError::Cancelled.into();
    assert_eq!(err.to_string(), "task cancelled");
    assert_eq!(err.downcast_ref::<SchedulerError>(), Some(&SchedulerError::Cancelled));
}
