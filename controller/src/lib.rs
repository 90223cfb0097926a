//! Cluster Controller - routing, registry and task scheduling for a
//! cluster of interactive compute engines.
//!
//! Engines connect to the controller and keep a persistent namespace.
//! Clients issue namespace operations (execute, push, pull, scatter,
//! gather, reset) against one, several or all engines, or submit tasks
//! that the controller schedules onto free engines with retry.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

/// Client-facing HTTP API.
pub mod api;
/// The controller actor and its client handle.
pub mod controller;
/// Engine worker: namespace, statement executor and stream runner.
pub mod engine;
/// Top-level error type for controller operations.
pub mod error;
/// Infrastructure components (config, server, telemetry, audit).
pub mod infrastructure;
/// Namespace operations and scatter/gather partitioning.
pub mod ops;
/// Correlation of in-flight engine calls with their replies.
pub mod pending;
/// Wire types and codec shared by controller and engines.
pub mod protocol;
/// Engine registry with liveness tracking.
pub mod registry;
/// Target resolution and request fan-out.
pub mod router;
/// Task queue, scheduling and retry.
pub mod tasks;
/// Engine-facing transports.
pub mod transport;

pub use controller::{Controller, ControllerHandle, EventSink, MultiCall};
pub use error::ControllerError;
pub use protocol::{Bindings, CallFailure, CallId, CallOutcome, EngineId, FailureKind};
pub use registry::TargetSelector;
pub use tasks::{Task, TaskId, TaskResult, TaskState};
