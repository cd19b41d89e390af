use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CubeError, Result};

pub const DEFAULT_PORT: u16 = 62910;
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_MAX_REQUESTS_PER_CONNECTION: u32 = 1000;
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

/// Settings for one gateway connection.
///
/// Read once at startup (or reconfiguration) and handed to the session and
/// client as plain values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Identifies this gateway to device listeners
    pub hub_id: String,
    /// Hostname or IP address of the gateway
    pub host: String,
    /// TCP port of the gateway
    pub port: u16,
    /// Seconds between two device list refreshes
    pub refresh_interval_secs: u64,
    /// Requests served by one connection before reconnecting (0 = unlimited)
    pub max_requests_per_connection: u32,
    /// Keep the connection open between exchanges
    pub exclusive: bool,
    /// Socket timeout for connect, read and write
    pub io_timeout_ms: u64,
    /// Milliseconds between two command queue flushes
    pub flush_interval_ms: u64,
    /// Maximum number of pending commands
    pub queue_capacity: usize,
    /// Where raw-line backups are written; backups are off when unset
    pub backup_directory: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            hub_id: "cube".to_string(),
            host: String::new(),
            port: DEFAULT_PORT,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            max_requests_per_connection: DEFAULT_MAX_REQUESTS_PER_CONNECTION,
            exclusive: false,
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            backup_directory: None,
        }
    }
}

impl GatewayConfig {
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// Parses and validates a JSON document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: GatewayConfig = serde_json::from_str(json)
            .map_err(|e| CubeError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(CubeError::InvalidConfig("host missing".into()));
        }
        if self.port == 0 {
            return Err(CubeError::InvalidConfig("port must be non-zero".into()));
        }
        if self.refresh_interval_secs == 0 {
            return Err(CubeError::InvalidConfig(
                "refresh_interval_secs must be greater than zero".into(),
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(CubeError::InvalidConfig(
                "flush_interval_ms must be greater than zero".into(),
            ));
        }
        if self.io_timeout_ms == 0 {
            return Err(CubeError::InvalidConfig(
                "io_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(CubeError::InvalidConfig(
                "queue_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Fluent construction of a validated [`GatewayConfig`].
#[derive(Debug, Default)]
pub struct GatewayConfigBuilder {
    hub_id: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    refresh_interval_secs: Option<u64>,
    max_requests_per_connection: Option<u32>,
    exclusive: Option<bool>,
    io_timeout_ms: Option<u64>,
    flush_interval_ms: Option<u64>,
    queue_capacity: Option<usize>,
    backup_directory: Option<PathBuf>,
}

impl GatewayConfigBuilder {
    pub fn hub_id(mut self, v: impl Into<String>) -> Self {
        self.hub_id = Some(v.into());
        self
    }
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
    pub fn refresh_interval_secs(mut self, v: u64) -> Self {
        self.refresh_interval_secs = Some(v);
        self
    }
    pub fn max_requests_per_connection(mut self, v: u32) -> Self {
        self.max_requests_per_connection = Some(v);
        self
    }
    pub fn exclusive(mut self, v: bool) -> Self {
        self.exclusive = Some(v);
        self
    }
    pub fn io_timeout_ms(mut self, v: u64) -> Self {
        self.io_timeout_ms = Some(v);
        self
    }
    pub fn flush_interval_ms(mut self, v: u64) -> Self {
        self.flush_interval_ms = Some(v);
        self
    }
    pub fn queue_capacity(mut self, v: usize) -> Self {
        self.queue_capacity = Some(v);
        self
    }
    pub fn backup_directory(mut self, v: impl Into<PathBuf>) -> Self {
        self.backup_directory = Some(v.into());
        self
    }

    pub fn build(self) -> Result<GatewayConfig> {
        let defaults = GatewayConfig::default();
        let config = GatewayConfig {
            hub_id: self.hub_id.unwrap_or(defaults.hub_id),
            host: self
                .host
                .ok_or_else(|| CubeError::InvalidConfig("host missing".into()))?,
            port: self.port.unwrap_or(defaults.port),
            refresh_interval_secs: self
                .refresh_interval_secs
                .unwrap_or(defaults.refresh_interval_secs),
            max_requests_per_connection: self
                .max_requests_per_connection
                .unwrap_or(defaults.max_requests_per_connection),
            exclusive: self.exclusive.unwrap_or(defaults.exclusive),
            io_timeout_ms: self.io_timeout_ms.unwrap_or(defaults.io_timeout_ms),
            flush_interval_ms: self.flush_interval_ms.unwrap_or(defaults.flush_interval_ms),
            queue_capacity: self.queue_capacity.unwrap_or(defaults.queue_capacity),
            backup_directory: self.backup_directory,
        };
        config.validate()?;
        Ok(config)
    }
}
