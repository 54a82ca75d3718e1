//! Server configuration.
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults
//! 2. the first TOML file found: `$COALESCE_CONFIG`, `./coalesce.toml`,
//!    `/etc/coalesce/coalesce.toml`, `~/.config/coalesce/coalesce.toml`
//! 3. `COALESCE_HOST` / `COALESCE_PORT`
//!
//! Every section and key is optional.

use anyhow::{Context, Result};
use coalesce_core::{RegistryConfig, WindowConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::reactor::ReactorConfig;

const SEARCH_PATHS: [&str; 3] = [
    "coalesce.toml",
    "/etc/coalesce/coalesce.toml",
    "~/.config/coalesce/coalesce.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub transport: TransportConfig,
    pub limits: LimitsConfig,
    pub window: WindowSettings,
    pub reactor: ReactorSettings,
    pub heartbeat: HeartbeatConfig,
    pub metrics: MetricsConfig,
}

/// `[transport]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Route of the WebSocket endpoint.
    pub websocket_path: String,
}

/// `[limits]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_connections: usize,
    pub max_rooms: usize,
    pub max_rooms_per_connection: usize,
    /// Largest accepted publication payload, in bytes.
    pub max_message_size: usize,
}

/// `[window]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowSettings {
    /// How long the reactor may sleep while a window is open. Values below
    /// 1 ms are raised to 1 ms.
    pub forced_wakeup_ms: u64,
    /// Flush a window once it holds this many bytes. Unset means windows
    /// close only on a quiet pass.
    pub max_batch_bytes: Option<usize>,
}

/// `[reactor]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorSettings {
    pub queue_capacity: usize,
    /// Upper bound on events drained per pass, so windows keep closing
    /// under sustained load.
    pub max_events_per_pass: usize,
}

/// `[heartbeat]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Advertised to clients in the `connected` frame.
    pub interval_ms: u64,
    /// Silence after which a connection is dropped.
    pub timeout_ms: u64,
}

/// `[metrics]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Port of the Prometheus scrape endpoint.
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            window: WindowSettings::default(),
            reactor: ReactorSettings::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
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
        let registry = RegistryConfig::default();
        Self {
            max_connections: ReactorConfig::default().max_connections,
            max_rooms: registry.max_rooms,
            max_rooms_per_connection: registry.max_rooms_per_subscriber,
            max_message_size: registry.max_payload_size,
        }
    }
}

impl Default for WindowSettings {
    fn default() -> Self {
        let window = WindowConfig::default();
        Self {
            forced_wakeup_ms: window.forced_wakeup.as_millis() as u64,
            max_batch_bytes: window.max_batch_bytes,
        }
    }
}

impl Default for ReactorSettings {
    fn default() -> Self {
        let reactor = ReactorConfig::default();
        Self {
            queue_capacity: reactor.queue_capacity,
            max_events_per_pass: reactor.max_events_per_pass,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 60_000,
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

impl Config {
    /// Load the first configuration file found, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be read or
    /// parsed, or if an override is malformed.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("COALESCE_CONFIG").ok();
        let candidates = explicit.iter().map(String::as_str).chain(SEARCH_PATHS);

        let mut config = None;
        for path in candidates {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                config = Some(Self::from_file(expanded.as_ref())?);
                break;
            }
        }

        let mut config = config.unwrap_or_default();
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

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Apply `COALESCE_HOST` / `COALESCE_PORT` as returned by `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("COALESCE_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("COALESCE_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("Invalid COALESCE_PORT: {port}"))?;
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

    /// Room registry settings derived from this configuration.
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_rooms: self.limits.max_rooms,
            max_rooms_per_subscriber: self.limits.max_rooms_per_connection,
            max_payload_size: self.limits.max_message_size,
            auto_delete_empty_rooms: true,
            window: WindowConfig {
                forced_wakeup: Duration::from_millis(self.window.forced_wakeup_ms.max(1)),
                max_batch_bytes: self.window.max_batch_bytes,
            },
        }
    }

    /// Reactor settings derived from this configuration.
    #[must_use]
    pub fn reactor_config(&self) -> ReactorConfig {
        ReactorConfig {
            queue_capacity: self.reactor.queue_capacity.max(1),
            max_events_per_pass: self.reactor.max_events_per_pass.max(1),
            max_connections: self.limits.max_connections,
        }
    }
}
