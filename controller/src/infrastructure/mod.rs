/// Audit logging for cluster lifecycle events.
pub mod audit;
/// Configuration management for the controller and engines.
pub mod config;
/// HTTP server for health, metrics and the client API.
pub mod server;
/// Telemetry setup for logging, tracing, and metrics.
pub mod telemetry;
