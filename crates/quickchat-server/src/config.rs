//! Server configuration.
//!
//! Resolution order, later wins:
//! 1. Built-in defaults
//! 2. The first TOML file found (`--config <path>`, `./quickchat.toml`,
//!    `/etc/quickchat/quickchat.toml`, `~/.config/quickchat/quickchat.toml`)
//! 3. `QUICKCHAT_HOST` / `QUICKCHAT_PORT`

use anyhow::{bail, Context, Result};
use quickchat_core::CoreConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SEARCH_PATHS: [&str; 3] = [
    "quickchat.toml",
    "/etc/quickchat/quickchat.toml",
    "~/.config/quickchat/quickchat.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub transport: TransportConfig,
    pub limits: LimitsConfig,
    pub heartbeat: HeartbeatConfig,
    pub metrics: MetricsConfig,
    /// Chat core settings (text length, broadcast buffers).
    pub chat: CoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Path of the WebSocket endpoint.
    pub websocket_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Concurrent WebSocket sessions; upgrades beyond this get 503.
    pub max_connections: usize,
    /// Largest inbound WebSocket message, in bytes. Image data URIs count.
    pub max_message_size: usize,
}

/// Session liveness, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// How often the server pings.
    pub interval_ms: u64,
    /// Silence after which a session is dropped.
    pub timeout_ms: u64,
    /// Time allowed for the `connect` frame.
    pub handshake_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Port of the Prometheus listener.
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            chat: CoreConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: "/ws".to_string(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_message_size: 1024 * 1024,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 60_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Config {
    /// Resolve the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the chosen file cannot be read or parsed, an
    /// environment override is malformed, or the result fails [`validate`].
    ///
    /// [`validate`]: Self::validate
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit.map(Path::to_path_buf).or_else(find_config_file) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = var("QUICKCHAT_HOST") {
            self.host = host;
        }
        if let Some(port) = var("QUICKCHAT_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("QUICKCHAT_PORT is not a port: {port:?}"))?;
        }
        Ok(())
    }

    /// Reject settings the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        if !self.transport.websocket_path.starts_with('/') {
            bail!("transport.websocket_path must start with '/'");
        }
        if self.heartbeat.interval_ms == 0 {
            bail!("heartbeat.interval_ms must be positive");
        }
        if self.heartbeat.timeout_ms <= self.heartbeat.interval_ms {
            bail!("heartbeat.timeout_ms must exceed heartbeat.interval_ms");
        }
        if self.chat.max_text_length == 0 {
            bail!("chat.max_text_length must be positive");
        }
        if self.chat.presence_capacity == 0 || self.chat.unseen_capacity == 0 {
            bail!("chat broadcast capacities must be positive");
        }
        Ok(())
    }

    /// Address to bind the HTTP listener to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

fn find_config_file() -> Option<PathBuf> {
    SEARCH_PATHS
        .iter()
        .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
        .find(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.chat, CoreConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            host = "0.0.0.0"

            [limits]
            max_connections = 500

            [heartbeat]
            interval_ms = 5000

            [chat]
            max_text_length = 280
            "#,
        )
        .unwrap();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.limits.max_connections, 500);
        assert_eq!(config.limits.max_message_size, 1024 * 1024);
        assert_eq!(config.heartbeat.interval(), Duration::from_millis(5000));
        assert_eq!(config.heartbeat.timeout_ms, 60_000);
        assert_eq!(config.chat.max_text_length, 280);
        assert_eq!(
            config.chat.presence_capacity,
            CoreConfig::default().presence_capacity
        );
    }

    #[test]
    fn test_env_overrides_file_values() {
        let env: HashMap<&str, &str> =
            HashMap::from([("QUICKCHAT_HOST", "0.0.0.0"), ("QUICKCHAT_PORT", "8080")]);
        let mut config = Config::default();
        config
            .apply_env(|key| env.get(key).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.bind_addr().unwrap(), "0.0.0.0:8080".parse().unwrap());

        let mut config = Config::default();
        assert!(config
            .apply_env(|key| (key == "QUICKCHAT_PORT").then(|| "http".to_string()))
            .is_err());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = Config::default();
        config.heartbeat.timeout_ms = config.heartbeat.interval_ms;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.websocket_path = "ws".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.chat.max_text_length = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_bind_addr() {
        let config = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/quickchat.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
