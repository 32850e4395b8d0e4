//! Tests for builder modules

use std::sync::Arc;

use prometheus_task_engine::builders::EngineBuilder;
use prometheus_task_engine::config::EngineConfig;
use prometheus_task_engine::core::{InMemoryEventSink, ResourceSpec, SchedulerError};
use prometheus_task_engine::runtime::TokioSpawner;
use prometheus_task_engine::util::ResourceKind;

#[test]
fn test_engine_builder_defaults() {
    let builder = EngineBuilder::default();
    assert_eq!(builder.config(), &EngineConfig::default());
}

#[test]
fn test_engine_builder_from_json() {
    let builder = EngineBuilder::from_json(r#"{"max_concurrent_tasks": 3}"#).unwrap();
    assert_eq!(builder.config().max_concurrent_tasks, 3);

    let err = EngineBuilder::from_json(r#"{"max_concurrent_tasks": 0}"#).unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidConfig(_)));
}

#[tokio::test]
async fn test_engine_builder_registers_resources_and_sinks() {
    let sink = InMemoryEventSink::new(16);
    let (scheduler, ids) = EngineBuilder::new(EngineConfig::default())
        .with_sink(Arc::new(sink.clone()))
        .with_resource(ResourceSpec::new("cpu", ResourceKind::Cpu, 8))
        .with_resource(ResourceSpec::new("vram", ResourceKind::GpuVram, 24))
        .build(TokioSpawner::try_current().unwrap())
        .unwrap();

    assert_eq!(ids.len(), 2);
    assert_eq!(scheduler.get_resource(&ids[1]).unwrap().capacity, 24);
    assert_eq!(sink.names(), vec!["resource:added", "resource:added"]);
}

#[tokio::test]
async fn test_engine_builder_rejects_bad_resource() {
    let err = EngineBuilder::default()
        .with_resource(ResourceSpec::new("empty", ResourceKind::Memory, 0))
        .build(TokioSpawner::try_current().unwrap())
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));
}
