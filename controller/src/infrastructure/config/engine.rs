//! Settings for the `cluster-engine` binary.

use serde::Deserialize;

use crate::protocol::Bindings;

/// Where a standalone engine dials and what it announces.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    /// Controller address. Falls back to `transport.engine_listen`.
    pub controller_addr: Option<String>,
    /// Properties sent with the registration.
    pub properties: Bindings,
}
