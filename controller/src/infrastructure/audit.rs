use serde::Serialize;
use tracing::{info, info_span};

/// Cluster lifecycle event for audit logging.
/// Structured for JSON serialization to enable machine-readable audit trails.
#[derive(Debug, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// The controller came up.
    ControllerStartup {
        /// Engine transport in use.
        transport: String,
        /// Client API address.
        api_addr: String,
    },
    /// The controller is going down.
    ControllerShutdown {
        /// What triggered the shutdown.
        reason: String,
    },
    /// An engine completed registration.
    EngineRegistered {
        /// Assigned engine ID.
        engine_id: u32,
        /// Transport connection carrying the engine.
        connection_id: String,
    },
    /// A registered engine went away.
    EngineLost {
        /// The engine's ID, now free for reuse.
        engine_id: u32,
        /// Why the connection ended.
        reason: String,
    },
}

/// Logs an audit event on the `audit` target as structured JSON, so a
/// subscriber can route it separately from operational logs.
pub fn log_audit(event: &AuditEvent) {
    let span = info_span!(target: "audit", "audit_event");
    let _enter = span.enter();

    let json = serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"));
    info!(target: "audit", audit_json = %json, "Cluster Audit Event");
}
