// config.rs - Node Configuration
//
//! Configuration for a transport node.
//!
//! Sources are layered, later ones winning:
//! - built-in defaults
//! - an optional configuration file (TOML or JSON, by extension)
//! - `HAMAS__*` environment variables, `__` separating nested keys
//!   (`HAMAS__ROUTER__INBOUND_CAPACITY=4096`)
//!
//! Connector sections are optional; a missing section leaves that connector
//! closed. Every connector takes its node name from the top-level
//! `node_name`.

use crate::connector::platform::PlatformConfig;
use crate::connector::unix::UnixConfig;
use crate::connector::zigbee::ZigBeeConfig;
use crate::observability::{MetricsConfig, TracingConfig};
use crate::router::RouterConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "HAMAS";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Everything a node needs to start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Name of this platform
    pub node_name: String,

    pub router: RouterConfig,

    pub tracing: TracingConfig,

    /// Prometheus endpoint; disabled when absent
    pub metrics: Option<MetricsConfig>,

    pub unix: Option<UnixConfig>,

    pub platform: Option<PlatformConfig>,

    pub zigbee: Option<ZigBeeConfig>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            node_name: "hamas".into(),
            router: RouterConfig::default(),
            tracing: TracingConfig::default(),
            metrics: None,
            unix: Some(UnixConfig::default()),
            platform: None,
            zigbee: None,
        }
    }
}

impl TransportConfig {
    /// Load defaults, then `path` if given, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.display().to_string()));
            }
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        let config = config.normalized();
        config.validate()?;

        match path {
            Some(path) => tracing::info!(path = %path.display(), "Configuration loaded"),
            None => tracing::debug!("Configuration loaded from defaults and environment"),
        }
        Ok(config)
    }

    /// Copy the node name into every connector section
    pub fn normalized(mut self) -> Self {
        let name = self.node_name.clone();
        if let Some(unix) = &mut self.unix {
            unix.node_name = name.clone();
        }
        if let Some(platform) = &mut self.platform {
            platform.node_name = name.clone();
        }
        if let Some(zigbee) = &mut self.zigbee {
            zigbee.node_name = name;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = self.node_name.trim();
        if name.is_empty() {
            return Err(ConfigError::Invalid("node_name is empty".into()));
        }
        if name.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "node_name '{name}' must not contain '/'"
            )));
        }

        let mut seen = HashSet::new();
        for kind in &self.router.priority {
            if !seen.insert(kind) {
                return Err(ConfigError::Invalid(format!(
                    "connector {kind} listed twice in router.priority"
                )));
            }
        }
        if self.router.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "router.retry.max_attempts must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.router.retry.jitter) {
            return Err(ConfigError::Invalid(
                "router.retry.jitter must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ConnectorKind;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.node_name, "hamas");
        assert_eq!(config.router.priority, ConnectorKind::ALL.to_vec());
        assert_eq!(config.router.retry.max_attempts, 3);
        assert_eq!(config.router.discovery_interval_ms, 30_000);
        assert!(config.unix.is_some());
        assert!(config.platform.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
node_name = "kitchen"

[router]
priority = ["platform", "local"]
discovery_interval_ms = 5000

[router.retry]
max_attempts = 5

[platform]
listen_addr = "127.0.0.1:7801"
keepalive_interval_ms = 1000

[zigbee]
mtu = 64
"#
        )
        .unwrap();

        let config = TransportConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.node_name, "kitchen");
        assert_eq!(
            config.router.priority,
            vec![ConnectorKind::Platform, ConnectorKind::Local]
        );
        assert_eq!(config.router.retry.max_attempts, 5);
        assert_eq!(config.router.retry.base_delay_ms, 50);
        assert_eq!(config.router.discovery_interval_ms, 5000);

        let platform = config.platform.unwrap();
        assert_eq!(platform.node_name, "kitchen");
        assert_eq!(platform.listen_addr, "127.0.0.1:7801".parse().unwrap());
        assert_eq!(platform.keepalive_interval_ms, 1000);
        assert_eq!(platform.keepalive_timeout_ms, 15_000);

        let zigbee = config.zigbee.unwrap();
        assert_eq!(zigbee.mtu, 64);
        assert_eq!(zigbee.node_name, "kitchen");
        assert_eq!(config.unix.unwrap().node_name, "kitchen");
    }

    #[test]
    fn test_missing_file() {
        let result = TransportConfig::load(Some(Path::new("/nonexistent/hamas.toml")));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_validation() {
        let mut config = TransportConfig::default();
        config.router.priority = vec![ConnectorKind::Unix, ConnectorKind::Unix];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = TransportConfig {
            node_name: "a/b".into(),
            ..TransportConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let config = TransportConfig {
            platform: Some(PlatformConfig::default()),
            ..TransportConfig::default()
        };
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: TransportConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
