//! Engine configuration and partial updates.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::AppResult;

/// Prefix of environment variables read by [`EngineConfig::from_env`].
pub const ENV_PREFIX: &str = "TASK_ENGINE_";

/// What `add_task` does when the pending count has reached `max_queue_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Enqueue anyway and raise `queue:full`.
    #[default]
    Admit,
    /// Refuse the submission with `QueueFull`.
    Reject,
}

/// What happens to parked dependents when a prerequisite fails or is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyFailurePolicy {
    /// Dependents stay pending until cancelled.
    #[default]
    Wait,
    /// Dependents fail with a dependency error.
    Propagate,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admit" => Ok(Self::Admit),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown overflow policy `{other}`")),
        }
    }
}

impl FromStr for DependencyFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(Self::Wait),
            "propagate" => Ok(Self::Propagate),
            other => Err(format!("unknown dependency failure policy `{other}`")),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of simultaneously running tasks.
    pub max_concurrent_tasks: usize,
    /// Default per-task timeout in milliseconds.
    pub task_timeout_ms: u64,
    /// Whether failed tasks are retried.
    pub enable_retry: bool,
    /// Default retry budget per task.
    pub max_retries: u32,
    /// Flat delay before a retried task re-enters the queue, in milliseconds.
    pub retry_delay_ms: u64,
    /// Priority ordering of the pending queue; FIFO when off.
    pub enable_priority_queue: bool,
    /// Dependency gating; prerequisites are ignored when off.
    pub enable_task_dependencies: bool,
    /// Whether workflows may be submitted.
    pub enable_workflow: bool,
    /// Whether resources may be registered and allocated.
    pub enable_resource_management: bool,
    /// Pending-task count at which the overflow policy applies.
    pub max_queue_size: usize,
    /// Behavior at `max_queue_size`.
    pub queue_overflow: OverflowPolicy,
    /// Behavior of parked dependents when a prerequisite ends unsuccessfully.
    pub dependency_failure: DependencyFailurePolicy,
    /// Samples kept for the moving average execution time.
    pub metrics_window: usize,
    /// Per-receiver buffer of the event broadcast channel.
    pub event_capacity: usize,
    /// Maximum event subscribers (sinks plus receivers).
    pub max_subscribers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: num_cpus::get().max(1),
            task_timeout_ms: 30_000,
            enable_retry: true,
            max_retries: 3,
            retry_delay_ms: 1_000,
            enable_priority_queue: true,
            enable_task_dependencies: true,
            enable_workflow: true,
            enable_resource_management: true,
            max_queue_size: 1_000,
            queue_overflow: OverflowPolicy::Admit,
            dependency_failure: DependencyFailurePolicy::Wait,
            metrics_window: 100,
            event_capacity: 1_024,
            max_subscribers: 64,
        }
    }
}

impl EngineConfig {
    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Describes the first offending field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_tasks == 0 {
            return Err("max_concurrent_tasks must be greater than 0".into());
        }
        if self.task_timeout_ms == 0 {
            return Err("task_timeout_ms must be greater than 0".into());
        }
        if self.max_queue_size == 0 {
            return Err("max_queue_size must be greater than 0".into());
        }
        if self.metrics_window == 0 {
            return Err("metrics_window must be greater than 0".into());
        }
        if self.event_capacity == 0 {
            return Err("event_capacity must be greater than 0".into());
        }
        if self.max_subscribers == 0 {
            return Err("max_subscribers must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `TASK_ENGINE_*` environment variables (a `.env` file is loaded first).
    ///
    /// # Errors
    ///
    /// A variable that does not parse, or an invalid result.
    pub fn from_env() -> AppResult<Self> {
        // A missing .env file is fine.
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        read_env("MAX_CONCURRENT_TASKS", &mut cfg.max_concurrent_tasks)?;
        read_env("TASK_TIMEOUT_MS", &mut cfg.task_timeout_ms)?;
        read_env("ENABLE_RETRY", &mut cfg.enable_retry)?;
        read_env("MAX_RETRIES", &mut cfg.max_retries)?;
        read_env("RETRY_DELAY_MS", &mut cfg.retry_delay_ms)?;
        read_env("ENABLE_PRIORITY_QUEUE", &mut cfg.enable_priority_queue)?;
        read_env("ENABLE_TASK_DEPENDENCIES", &mut cfg.enable_task_dependencies)?;
        read_env("ENABLE_WORKFLOW", &mut cfg.enable_workflow)?;
        read_env("ENABLE_RESOURCE_MANAGEMENT", &mut cfg.enable_resource_management)?;
        read_env("MAX_QUEUE_SIZE", &mut cfg.max_queue_size)?;
        read_env("QUEUE_OVERFLOW", &mut cfg.queue_overflow)?;
        read_env("DEPENDENCY_FAILURE", &mut cfg.dependency_failure)?;
        read_env("METRICS_WINDOW", &mut cfg.metrics_window)?;
        read_env("EVENT_CAPACITY", &mut cfg.event_capacity)?;
        read_env("MAX_SUBSCRIBERS", &mut cfg.max_subscribers)?;
        cfg.validate().map_err(anyhow::Error::msg)?;
        Ok(cfg)
    }

    /// Default task timeout.
    #[must_use]
    pub const fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Retry delay.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Set the concurrency bound.
    #[must_use]
    pub const fn with_max_concurrent_tasks(mut self, n: usize) -> Self {
        self.max_concurrent_tasks = n;
        self
    }

    /// Set the default task timeout.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable or disable retries and set the default budget.
    #[must_use]
    pub const fn with_retry(mut self, enabled: bool, max_retries: u32) -> Self {
        self.enable_retry = enabled;
        self.max_retries = max_retries;
        self
    }

    /// Set the flat retry delay.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Toggle priority ordering.
    #[must_use]
    pub const fn with_priority_queue(mut self, enabled: bool) -> Self {
        self.enable_priority_queue = enabled;
        self
    }

    /// Toggle dependency gating.
    #[must_use]
    pub const fn with_task_dependencies(mut self, enabled: bool) -> Self {
        self.enable_task_dependencies = enabled;
        self
    }

    /// Toggle workflows.
    #[must_use]
    pub const fn with_workflows(mut self, enabled: bool) -> Self {
        self.enable_workflow = enabled;
        self
    }

    /// Toggle resource management.
    #[must_use]
    pub const fn with_resource_management(mut self, enabled: bool) -> Self {
        self.enable_resource_management = enabled;
        self
    }

    /// Set the queue bound and its overflow policy.
    #[must_use]
    pub const fn with_queue_limit(mut self, max_queue_size: usize, overflow: OverflowPolicy) -> Self {
        self.max_queue_size = max_queue_size;
        self.queue_overflow = overflow;
        self
    }

    /// Set the dependency failure policy.
    #[must_use]
    pub const fn with_dependency_failure(mut self, policy: DependencyFailurePolicy) -> Self {
        self.dependency_failure = policy;
        self
    }

    /// Set the metrics sample window.
    #[must_use]
    pub const fn with_metrics_window(mut self, window: usize) -> Self {
        self.metrics_window = window;
        self
    }

    /// Set the event channel buffer and the subscriber limit.
    #[must_use]
    pub const fn with_events(mut self, capacity: usize, max_subscribers: usize) -> Self {
        self.event_capacity = capacity;
        self.max_subscribers = max_subscribers;
        self
    }
}

fn read_env<T>(key: &str, slot: &mut T) -> AppResult<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let name = format!("{ENV_PREFIX}{key}");
    match std::env::var(&name) {
        Ok(raw) => {
            *slot = raw
                .trim()
                .parse()
                .map_err(|e: T::Err| anyhow::anyhow!("{e}"))
                .with_context(|| format!("invalid value for {name}: `{raw}`"))?;
            Ok(())
        }
        Err(_) => Ok(()),
    }
}

/// Partial configuration update; `None` fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    /// See [`EngineConfig::max_concurrent_tasks`].
    pub max_concurrent_tasks: Option<usize>,
    /// See [`EngineConfig::task_timeout_ms`].
    pub task_timeout_ms: Option<u64>,
    /// See [`EngineConfig::enable_retry`].
    pub enable_retry: Option<bool>,
    /// See [`EngineConfig::max_retries`].
    pub max_retries: Option<u32>,
    /// See [`EngineConfig::retry_delay_ms`].
    pub retry_delay_ms: Option<u64>,
    /// See [`EngineConfig::enable_priority_queue`].
    pub enable_priority_queue: Option<bool>,
    /// See [`EngineConfig::enable_task_dependencies`].
    pub enable_task_dependencies: Option<bool>,
    /// See [`EngineConfig::enable_workflow`].
    pub enable_workflow: Option<bool>,
    /// See [`EngineConfig::enable_resource_management`].
    pub enable_resource_management: Option<bool>,
    /// See [`EngineConfig::max_queue_size`].
    pub max_queue_size: Option<usize>,
    /// See [`EngineConfig::queue_overflow`].
    pub queue_overflow: Option<OverflowPolicy>,
    /// See [`EngineConfig::dependency_failure`].
    pub dependency_failure: Option<DependencyFailurePolicy>,
    /// See [`EngineConfig::metrics_window`].
    pub metrics_window: Option<usize>,
}

impl ConfigUpdate {
    /// Configuration with this update applied on top of `base`. Not validated.
    #[must_use]
    pub fn apply(&self, base: &EngineConfig) -> EngineConfig {
        EngineConfig {
            max_concurrent_tasks: self.max_concurrent_tasks.unwrap_or(base.max_concurrent_tasks),
            task_timeout_ms: self.task_timeout_ms.unwrap_or(base.task_timeout_ms),
            enable_retry: self.enable_retry.unwrap_or(base.enable_retry),
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            retry_delay_ms: self.retry_delay_ms.unwrap_or(base.retry_delay_ms),
            enable_priority_queue: self.enable_priority_queue.unwrap_or(base.enable_priority_queue),
            enable_task_dependencies: self
                .enable_task_dependencies
                .unwrap_or(base.enable_task_dependencies),
            enable_workflow: self.enable_workflow.unwrap_or(base.enable_workflow),
            enable_resource_management: self
                .enable_resource_management
                .unwrap_or(base.enable_resource_management),
            max_queue_size: self.max_queue_size.unwrap_or(base.max_queue_size),
            queue_overflow: self.queue_overflow.unwrap_or(base.queue_overflow),
            dependency_failure: self.dependency_failure.unwrap_or(base.dependency_failure),
            metrics_window: self.metrics_window.unwrap_or(base.metrics_window),
            event_capacity: base.event_capacity,
            max_subscribers: base.max_subscribers,
        }
    }

    /// Set the concurrency bound.
    #[must_use]
    pub const fn max_concurrent_tasks(mut self, n: usize) -> Self {
        self.max_concurrent_tasks = Some(n);
        self
    }

    /// Toggle priority ordering.
    #[must_use]
    pub const fn enable_priority_queue(mut self, enabled: bool) -> Self {
        self.enable_priority_queue = Some(enabled);
        self
    }

    /// Toggle dependency gating.
    #[must_use]
    pub const fn enable_task_dependencies(mut self, enabled: bool) -> Self {
        self.enable_task_dependencies = Some(enabled);
        self
    }

    /// Enable or disable retries.
    #[must_use]
    pub const fn enable_retry(mut self, enabled: bool) -> Self {
        self.enable_retry = Some(enabled);
        self
    }
}
