//! Engine transport settings.

use serde::Deserialize;

use crate::transport::TransportKind;

/// Which transport engines use and where they reach the controller.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSettings {
    /// Transport selection.
    pub kind: TransportKind,
    /// Address the controller listens on for `vanilla` engines.
    pub engine_listen: String,
    /// Number of in-process engines started for the `local` transport.
    pub local_engines: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            kind: TransportKind::Vanilla,
            engine_listen: "127.0.0.1:10105".to_string(),
            local_engines: 4,
        }
    }
}
