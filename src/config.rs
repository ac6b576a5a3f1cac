//! Configuration file support
//!
//! Loads configuration from ~/.config/ndt-legacy/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerDefaults,
}

/// Default settings for server mode
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerDefaults {
    /// Legacy listen address (e.g., ":3001")
    pub legacy_addr: Option<String>,

    /// WebSocket listen address, also the proxy target
    pub http_addr: Option<String>,

    /// WSS listen address
    pub tls_addr: Option<String>,

    /// TLS certificate path
    pub cert: Option<String>,

    /// TLS key path
    pub key: Option<String>,

    /// Sub-test duration (e.g., "10s")
    pub test_duration: Option<String>,

    /// Prometheus metrics port
    pub prometheus_port: Option<u16>,

    /// Log file path (e.g., "~/.config/ndt-legacy/ndt.log", null to disable)
    pub log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from the default path.
    /// Returns default config if file doesn't exist.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ndt-legacy")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.server.legacy_addr.is_none());
        assert!(config.server.test_duration.is_none());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
legacy_addr = ":3010"
http_addr = "127.0.0.1:3020"
test_duration = "5s"
prometheus_port = 9090
log_level = "debug"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.legacy_addr.as_deref(), Some(":3010"));
        assert_eq!(config.server.http_addr.as_deref(), Some("127.0.0.1:3020"));
        assert_eq!(config.server.test_duration.as_deref(), Some("5s"));
        assert_eq!(config.server.prometheus_port, Some(9090));
        assert!(config.server.tls_addr.is_none());
    }

    #[test]
    fn test_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.server.http_addr.is_none());
    }

    #[test]
    fn test_config_path() {
        let path = Config::config_path();
        assert!(path.ends_with("ndt-legacy/config.toml"));
    }
}
