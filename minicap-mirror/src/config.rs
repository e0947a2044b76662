//! Configuration for the mirror binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use minicap_core::config::{
    DEFAULT_POLL_INTERVAL, DEFAULT_READ_BUFFER, DEFAULT_RETRY_BACKOFF, DEFAULT_COMMAND_TIMEOUT,
};
use minicap_core::{
    AdbConfig, ClientConfig, DEFAULT_PORT, DEFAULT_QUEUE_CAPACITY, DEFAULT_START_TIMEOUT,
    ProjectionConfig, ProjectionParams, ServerConfig,
};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Forwarded socket and client buffering.
    pub network: NetworkConfig,
    /// Scale, rotation and JPEG quality.
    pub projection: ProjectionParams,
    /// How to reach the device.
    pub device: DeviceConfig,
    /// Where frames go.
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host the forwarded port is reachable on.
    pub host: String,
    /// Local port forwarded to the helper socket.
    pub port: u16,
    /// Frames buffered before the oldest is dropped.
    pub queue_capacity: usize,
    /// Reconnect when the helper closes the stream.
    pub reconnect: bool,
    pub retry_backoff_ms: u64,
    pub read_buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Path to the `adb` executable.
    pub adb_path: PathBuf,
    /// Device serial; empty selects adb's default device.
    pub serial: String,
    /// Directory holding the helper binaries per ABI.
    pub resource_dir: PathBuf,
    /// How long to wait for the helper's first output.
    pub start_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// File that always holds the latest frame.
    pub path: PathBuf,
    /// Interval between throughput log lines.
    pub stats_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reconnect: true,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF.as_millis() as u64,
            read_buffer_size: DEFAULT_READ_BUFFER,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            serial: String::new(),
            resource_dir: PathBuf::from("minicap"),
            start_timeout_ms: DEFAULT_START_TIMEOUT.as_millis() as u64,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("screen.jpg"),
            stats_interval_ms: 1000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl MirrorConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Parse and validate TOML text.
    pub fn parse(text: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let cfg: Self = toml::from_str(text)?;
        cfg.projection.validate()?;
        Ok(cfg)
    }

    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            host: self.network.host.clone(),
            port: self.network.port,
            queue_capacity: self.network.queue_capacity.max(1),
            reconnect: self.network.reconnect,
            retry_backoff: Duration::from_millis(self.network.retry_backoff_ms),
            read_buffer_size: self.network.read_buffer_size.max(1),
        }
    }

    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.network.port,
            params: self.projection,
            poll_interval: Duration::from_millis(self.device.poll_interval_ms.max(1)),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn to_adb_config(&self) -> AdbConfig {
        AdbConfig {
            adb_path: self.device.adb_path.clone(),
            serial: self.device.serial.clone(),
            resource_dir: self.device.resource_dir.clone(),
        }
    }

    pub fn to_projection_config(&self) -> ProjectionConfig {
        ProjectionConfig {
            client: self.to_client_config(),
            server: self.to_server_config(),
            start_timeout: Duration::from_millis(self.device.start_timeout_ms),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
