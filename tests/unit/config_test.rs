//! Tests for configuration validation

use std::time::Duration;

use prometheus_task_engine::config::{ConfigUpdate, DependencyFailurePolicy, EngineConfig, OverflowPolicy};

#[test]
fn test_engine_config_validation() {
    assert!(EngineConfig::default().validate().is_ok());
}

#[test]
fn test_engine_config_invalid_concurrency() {
    let invalid = EngineConfig::default().with_max_concurrent_tasks(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_engine_config_invalid_queue_size() {
    let invalid = EngineConfig::default().with_queue_limit(0, OverflowPolicy::Admit);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_engine_config_invalid_timeout() {
    let invalid = EngineConfig::default().with_task_timeout(Duration::ZERO);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_engine_config_from_json() {
    let json = r#"{
        "max_concurrent_tasks": 8,
        "task_timeout_ms": 5000,
        "enable_retry": false,
        "retry_delay_ms": 250,
        "enable_priority_queue": false,
        "queue_overflow": "reject"
    }"#;

    let config = EngineConfig::from_json_str(json).unwrap();
    assert_eq!(config.max_concurrent_tasks, 8);
    assert_eq!(config.task_timeout(), Duration::from_secs(5));
    assert!(!config.enable_retry);
    assert_eq!(config.retry_delay(), Duration::from_millis(250));
    assert!(!config.enable_priority_queue);
    assert_eq!(config.queue_overflow, OverflowPolicy::Reject);
    assert_eq!(config.dependency_failure, DependencyFailurePolicy::Wait);
}

#[test]
fn test_engine_config_from_json_rejects_invalid() {
    assert!(EngineConfig::from_json_str(r#"{"max_concurrent_tasks": 0}"#).is_err());
    assert!(EngineConfig::from_json_str("not json").unwrap_err().starts_with("parse error"));
}

// Both environment cases share one test: tests run in parallel and the variables are process-wide.
#[test]
fn test_engine_config_from_env() {
    std::env::set_var("TASK_ENGINE_MAX_RETRIES", "7");
    std::env::set_var("TASK_ENGINE_DEPENDENCY_FAILURE", "propagate");
    let config = EngineConfig::from_env().unwrap();
    assert_eq!(config.max_retries, 7);
    assert_eq!(config.dependency_failure, DependencyFailurePolicy::Propagate);

    std::env::set_var("TASK_ENGINE_METRICS_WINDOW", "lots");
    let err = EngineConfig::from_env().unwrap_err();
    assert!(err.to_string().contains("TASK_ENGINE_METRICS_WINDOW"));

    for key in ["MAX_RETRIES", "DEPENDENCY_FAILURE", "METRICS_WINDOW"] {
        std::env::remove_var(format!("TASK_ENGINE_{key}"));
    }
}

#[test]
fn test_config_update_from_json() {
    let update: ConfigUpdate = serde_json::from_str(r#"{"max_retries": 1}"#).unwrap();
    let next = update.apply(&EngineConfig::default());
    assert_eq!(next.max_retries, 1);
    assert_eq!(next.max_queue_size, EngineConfig::default().max_queue_size);
}
