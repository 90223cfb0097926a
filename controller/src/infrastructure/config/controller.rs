//! Controller core settings.

use serde::Deserialize;
use std::time::Duration;

use crate::protocol::{Codec, DEFAULT_MAX_MESSAGE_SIZE};

/// Settings for the controller actor.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerSettings {
    /// Deadline applied to every call, in milliseconds. Unset means calls
    /// wait until the engine answers or disconnects.
    pub default_call_timeout_ms: Option<u64>,
    /// Largest encoded message accepted in either direction, in bytes.
    pub max_message_size: usize,
    /// Retry budget for tasks that do not set their own.
    pub default_retries: u32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            default_call_timeout_ms: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            default_retries: 0,
        }
    }
}

impl ControllerSettings {
    /// The codec these settings describe.
    #[must_use]
    pub const fn codec(&self) -> Codec {
        Codec::new(self.max_message_size)
    }

    /// The per-call deadline, if any.
    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        self.default_call_timeout_ms.map(Duration::from_millis)
    }
}
