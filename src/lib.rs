//! # Prometheus Task Engine
//!
//! An in-process, concurrency-bounded task and workflow execution engine.
//!
//! Callers submit units of work ("tasks") with a priority, optional
//! prerequisites, a timeout and a retry budget. The scheduler keeps at most
//! `max_concurrent_tasks` of them running, parks tasks whose prerequisites or
//! declared resources are not available, and wakes them when they are. Every
//! state transition is published as a typed [`core::EngineEvent`].
//!
//! ## Key Features
//!
//! - **Bounded concurrency**: a single admission loop over a priority queue
//!   (`critical > high > medium > low`, FIFO within a priority)
//! - **Dependency gating**: blocked tasks are parked against their
//!   prerequisites and woken directly when those complete
//! - **Retries and timeouts**: flat-delay retries up to a per-task budget;
//!   timeouts are enforced by the scheduler and late results discarded
//! - **Cooperative cancellation**: every handler receives a cancellation token
//! - **Workflows**: a group of tasks whose status is derived from its members
//! - **Resource ledger**: finite named resources with all-or-nothing reservations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use prometheus_task_engine::config::EngineConfig;
//! use prometheus_task_engine::core::{handler_fn, TaskScheduler, TaskSpec};
//! use prometheus_task_engine::runtime::TokioSpawner;
//! use prometheus_task_engine::util::serde::Priority;
//!
//! let scheduler = TaskScheduler::new(
//!     EngineConfig::default().with_max_concurrent_tasks(2),
//!     TokioSpawner::try_current()?,
//! )?;
//!
//! let fetch = scheduler.add_task(
//!     TaskSpec::new("fetch", handler_fn(|ctx| async move {
//!         ctx.report_progress(50.0);
//!         Ok(serde_json::json!({ "rows": 42 }))
//!     }))
//!     .with_priority(Priority::High),
//! )?;
//!
//! let report = scheduler.add_task(
//!     TaskSpec::new("report", handler_fn(move |ctx| async move {
//!         let rows = ctx.dependency_result(&fetch).cloned();
//!         Ok(serde_json::json!({ "input": rows }))
//!     }))
//!     .depends_on(fetch),
//! )?;
//!
//! let done = scheduler.wait_for_task(report).await?;
//! ```
//!
//! For complete scenarios, see `tests/scheduler_test.rs` and `tests/workflow_test.rs`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions: tasks, queue, dependencies, retries, resources, workflows, events.
pub mod core;
/// Configuration models for the engine, queue bounds, and feature toggles.
pub mod config;
/// Builders to construct the engine from configuration.
pub mod builders;
/// Runtime adapters.
pub mod runtime;
/// Shared utilities.
pub mod util;
