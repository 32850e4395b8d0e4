//! Tests for utility functions

use prometheus_task_engine::util::{now_ms, Priority, ResourceKind, TaskId, WorkflowId};

#[test]
fn test_priority_ordering() {
    assert!(Priority::Critical > Priority::High);
    assert!(Priority::High > Priority::Medium);
    assert!(Priority::Medium > Priority::Low);
    assert_eq!(Priority::default(), Priority::Medium);
}

#[test]
fn test_priority_wire_names() {
    assert_eq!(serde_json::to_string(&Priority::Critical).unwrap(), "\"critical\"");
    let p: Priority = serde_json::from_str("\"low\"").unwrap();
    assert_eq!(p, Priority::Low);
}

#[test]
fn test_resource_kind_serialization() {
    assert_eq!(serde_json::to_string(&ResourceKind::GpuVram).unwrap(), "\"gpu_vram\"");
    let custom: ResourceKind = serde_json::from_str(r#"{"custom":"api_quota"}"#).unwrap();
    assert_eq!(custom, ResourceKind::Custom("api_quota".into()));
}

#[test]
fn test_ids_are_unique_and_parse() {
    let a = TaskId::new();
    let b = TaskId::new();
    assert_ne!(a, b);
    let parsed: TaskId = a.to_string().parse().unwrap();
    assert_eq!(parsed, a);
    assert!("not-a-uuid".parse::<WorkflowId>().is_err());
}

#[test]
fn test_now_ms_is_monotonic_enough() {
    let first = now_ms();
    let second = now_ms();
    assert!(second >= first);
    assert!(first > 0);
}
