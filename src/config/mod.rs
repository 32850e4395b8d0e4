//! Configuration models for the engine, queue bounds, and feature toggles.

pub mod engine;

pub use engine::{ConfigUpdate, DependencyFailurePolicy, EngineConfig, OverflowPolicy, ENV_PREFIX};
