// src/utils/config.rs
//! Engine configuration
//!
//! Configuration is layered with the `config` crate:
//!
//! 1. Built-in defaults ([`EngineConfig::default`])
//! 2. Optional `vuser-engine.{toml,yaml,json}` in the working directory
//! 3. Environment variables prefixed with `VUSER_ENGINE`, nested with `__`
//!    (e.g. `VUSER_ENGINE_BACKEND__PORT=9000`)

use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default number of UTF-16 code units in each handoff buffer
pub const DEFAULT_HANDOFF_BUFFER_SIZE: usize = 4096;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backend (RunLogic) connection settings
    pub backend: BackendConfig,

    /// Per-vuser runtime settings
    pub runtime: RuntimeConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Metrics exporter settings
    pub metrics: MetricsConfig,

    /// Settings for the probe binary
    pub probe: ProbeConfig,
}

/// Backend connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend host name or address
    pub host: String,

    /// Backend port
    pub port: u16,

    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            connect_timeout_ms: 5000,
        }
    }
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Per-vuser runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Slots per handoff buffer (UTF-16 code units)
    pub handoff_buffer_size: usize,

    /// How long `init_vuser` waits for both unit acknowledgements
    pub init_timeout_ms: u64,

    /// How long `stop` waits for unit threads to exit
    pub stop_timeout_ms: u64,

    /// Capacity of the broadcast channel behind `VuserManager::subscribe`
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            handoff_buffer_size: DEFAULT_HANDOFF_BUFFER_SIZE,
            init_timeout_ms: 10_000,
            stop_timeout_ms: 5000,
            event_capacity: 1024,
        }
    }
}

impl RuntimeConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`)
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Metrics exporter settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus listener; exporter disabled when unset
    pub listen_addr: Option<SocketAddr>,
}

/// Probe binary settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Number of vusers to run
    pub vusers: u32,

    /// Action iterations per vuser
    pub iterations: u32,

    /// Payload sent with every ping
    pub payload: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            vusers: 1,
            iterations: 1,
            payload: "PING".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, optional file and environment
    pub fn load() -> Result<Self> {
        Self::build(File::with_name("vuser-engine").required(false))
    }

    /// Load configuration from an explicit file (plus environment overrides)
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(File::from(path.as_ref()).required(true))
    }

    fn build<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let defaults = Config::try_from(&EngineConfig::default())
            .map_err(|e| EngineError::ConfigError(format!("Invalid defaults: {}", e)))?;

        let settings = Config::builder()
            .add_source(defaults)
            .add_source(file)
            .add_source(
                Environment::with_prefix("VUSER_ENGINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| EngineError::ConfigError(e.to_string()))?;

        let config: EngineConfig = settings
            .try_deserialize()
            .map_err(|e| EngineError::ConfigError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.backend.host.trim().is_empty() {
            return Err(EngineError::ConfigError("backend.host cannot be empty".into()));
        }
        if self.backend.connect_timeout_ms == 0 {
            return Err(EngineError::ConfigError(
                "backend.connect_timeout_ms must be positive".into(),
            ));
        }
        if self.runtime.handoff_buffer_size == 0 {
            return Err(EngineError::ConfigError(
                "runtime.handoff_buffer_size must be positive".into(),
            ));
        }
        if self.runtime.init_timeout_ms == 0 || self.runtime.stop_timeout_ms == 0 {
            return Err(EngineError::ConfigError(
                "runtime timeouts must be positive".into(),
            ));
        }
        if self.runtime.event_capacity == 0 {
            return Err(EngineError::ConfigError(
                "runtime.event_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.runtime.handoff_buffer_size, 4096);
        assert_eq!(config.backend.port, 8765);
        assert!(config.metrics.listen_addr.is_none());
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        let mut config = EngineConfig::default();
        config.runtime.handoff_buffer_size = 0;
        assert!(matches!(config.validate(), Err(EngineError::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_empty_host() {
        let mut config = EngineConfig::default();
        config.backend.host = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[backend]\nport = 9100\n\n[runtime]\nhandoff_buffer_size = 128\n\n[probe]\nvusers = 3"
        )
        .unwrap();

        let config = EngineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.backend.port, 9100);
        assert_eq!(config.backend.host, "127.0.0.1");
        assert_eq!(config.runtime.handoff_buffer_size, 128);
        assert_eq!(config.probe.vusers, 3);
        assert_eq!(config.probe.payload, "PING");
    }

    #[test]
    fn test_load_from_invalid_file_fails_validation() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "[runtime]\nhandoff_buffer_size = 0").unwrap();

        assert!(EngineConfig::load_from(file.path()).is_err());
    }
}
