//! Server configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file (`rendezvous.toml`)
//! - Environment variables (`RENDEZVOUS_HOST`, `RENDEZVOUS_PORT`)

use anyhow::{Context, Result};
use rendezvous_core::{AudienceScope, RelayConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Connection registry policy.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Fan-out dispatch configuration.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Connection registry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// `global` or `channel`.
    #[serde(default)]
    pub audience: AudienceScope,

    #[serde(default = "default_true")]
    pub evict_on_reconnect: bool,

    #[serde(default = "default_true")]
    pub touch_on_keepalive: bool,
}

/// How fan-out work leaves the connection task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Run fan-out on the connection task.
    Inline,
    /// Hand fan-out to a background worker.
    #[default]
    Queued,
}

/// Fan-out dispatch configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub mode: DispatchMode,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_frame_size() -> usize {
    32 * 1024 // 32 KB
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            registry: RegistryConfig::default(),
            dispatch: DispatchConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            audience: AudienceScope::default(),
            evict_on_reconnect: true,
            touch_on_keepalive: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, or defaults.
    /// Environment variables override either.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override is malformed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "rendezvous.toml",
            "/etc/rendezvous/rendezvous.toml",
            "~/.config/rendezvous/rendezvous.toml",
        ];

        let mut config = Self::default();
        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                config = Self::from_file(expanded.as_ref())?;
                break;
            }
        }

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = var("RENDEZVOUS_HOST") {
            self.host = host;
        }
        if let Some(port) = var("RENDEZVOUS_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("Invalid RENDEZVOUS_PORT: {port}"))?;
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Relay policy for the core components.
    #[must_use]
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            audience: self.registry.audience,
            evict_on_reconnect: self.registry.evict_on_reconnect,
            touch_on_keepalive: self.registry.touch_on_keepalive,
        }
    }
}
