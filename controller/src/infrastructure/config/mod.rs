//! Configuration management for the cluster controller.
//!
//! Settings are layered: built-in defaults, then an optional TOML file,
//! then `CLUSTER__SECTION__KEY` environment variables. Every section
//! rejects unknown keys, so a misspelt option fails loudly at startup.
//!
//! # Example
//!
//! ```no_run
//! use cluster_controller::infrastructure::config::Settings;
//!
//! let settings = Settings::new().expect("Failed to load configuration");
//! ```

pub mod controller;
pub mod engine;
pub mod server;
pub mod telemetry;
pub mod transport;

pub use controller::ControllerSettings;
pub use engine::EngineSettings;
pub use server::ServerSettings;
pub use telemetry::TelemetrySettings;
pub use transport::TransportSettings;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;

use crate::transport::TransportKind;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_VAR: &str = "CLUSTER_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "cluster.toml";

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Controller actor settings.
    pub controller: ControllerSettings,
    /// Engine transport settings.
    pub transport: TransportSettings,
    /// Client HTTP API settings.
    pub server: ServerSettings,
    /// Telemetry settings.
    pub telemetry: TelemetrySettings,
    /// Standalone engine settings.
    pub engine: EngineSettings,
}

impl Settings {
    /// Loads settings from the file named by `CLUSTER_CONFIG` (or
    /// `cluster.toml` if present) and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed, a key is unknown, or a
    /// value is out of range.
    pub fn new() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_VAR).ok();
        let required = path.is_some();
        let path = path.unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let settings: Self = Config::builder()
            .add_source(File::new(&path, FileFormat::Toml).required(required))
            .add_source(
                Environment::with_prefix("CLUSTER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from a TOML file only.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let settings: Self = Config::builder()
            .add_source(File::from(path.as_ref()).format(FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Checks cross-field and range constraints.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Message` naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.controller.max_message_size == 0 {
            return Err(invalid("controller.max_message_size must be positive"));
        }
        if u32::try_from(self.controller.max_message_size).is_err() {
            return Err(invalid("controller.max_message_size must fit in 32 bits"));
        }
        if self.controller.default_call_timeout_ms == Some(0) {
            return Err(invalid("controller.default_call_timeout_ms must be positive"));
        }
        if self.transport.kind == TransportKind::Local && self.transport.local_engines == 0 {
            return Err(invalid("transport.local_engines must be positive for the local transport"));
        }
        if !(0.0..=1.0).contains(&self.telemetry.sampling_ratio) {
            return Err(invalid("telemetry.sampling_ratio must be within [0, 1]"));
        }
        Ok(())
    }

    /// Address the client API binds to.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is not an IP address.
    pub fn server_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        BindAddress(self.server.host.clone(), self.server.port).to_socket_addr()
    }

    /// Address a standalone engine dials.
    #[must_use]
    pub fn engine_target(&self) -> &str {
        self.engine
            .controller_addr
            .as_deref()
            .unwrap_or(&self.transport.engine_listen)
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Message(message.to_string())
}

/// Helper for strong typing addresses
pub struct BindAddress(pub String, pub u16);

impl BindAddress {
    /// Converts the bind address to a `SocketAddr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the IP address string cannot be parsed.
    pub fn to_socket_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        let ip = self
            .0
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid IP address '{}': {e}", self.0))?;
        Ok(std::net::SocketAddr::new(ip, self.1))
    }
}
