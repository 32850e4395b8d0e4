//! Builder to construct a scheduler from configuration, sinks and resources.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::core::{EventSink, ResourceSpec, SchedulerError, Spawn, TaskScheduler};
use crate::util::serde::ResourceId;

/// Assembles a [`TaskScheduler`] with event sinks and resources attached up front.
pub struct EngineBuilder {
    config: EngineConfig,
    sinks: Vec<Arc<dyn EventSink>>,
    resources: Vec<ResourceSpec>,
}

impl EngineBuilder {
    /// Start from a configuration.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            sinks: Vec::new(),
            resources: Vec::new(),
        }
    }

    /// Start from a JSON configuration document.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when the document does not parse or validate.
    pub fn from_json(input: &str) -> Result<Self, SchedulerError> {
        EngineConfig::from_json_str(input)
            .map(Self::new)
            .map_err(SchedulerError::InvalidConfig)
    }

    /// Configuration the scheduler will start with.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Attach an event sink before any event is published.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Register a resource at build time.
    #[must_use]
    pub fn with_resource(mut self, spec: ResourceSpec) -> Self {
        self.resources.push(spec);
        self
    }

    /// Build the scheduler. Returns the ids of pre-registered resources in registration order.
    ///
    /// # Errors
    ///
    /// `InvalidConfig`, `TooManySubscribers`, or any resource registration error.
    pub fn build<S>(self, spawner: S) -> Result<(TaskScheduler<S>, Vec<ResourceId>), SchedulerError>
    where
        S: Spawn + Send + Sync + 'static,
    {
        let scheduler = TaskScheduler::new(self.config, spawner)?;
        for sink in self.sinks {
            scheduler.attach_sink(sink)?;
        }
        let resource_ids = self
            .resources
            .into_iter()
            .map(|spec| scheduler.register_resource(spec))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(resources = resource_ids.len(), "engine built");
        Ok((scheduler, resource_ids))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("sinks", &self.sinks.len())
            .field("resources", &self.resources)
            .finish()
    }
}
