//! Typed configuration for the capture client and server.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CaptureError;
use crate::queue::DEFAULT_QUEUE_CAPACITY;

/// Local port forwarded to the helper's abstract socket.
pub const DEFAULT_PORT: u16 = 1717;

/// Backoff between failed connection attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Size of each socket read.
pub const DEFAULT_READ_BUFFER: usize = 100 * 1024;

/// Interval at which `wait_running` re-checks the server state.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Bound on a single remote helper invocation (effectively unbounded).
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

// ── Rotation ─────────────────────────────────────────────────────

/// Display rotation requested from the capture helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub const fn degrees(self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

impl TryFrom<u16> for Rotation {
    type Error = CaptureError;

    fn try_from(degrees: u16) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            _ => Err(CaptureError::InvalidConfig(
                "rotation must be 0, 90, 180 or 270",
            )),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.degrees())
    }
}

// ── PhysicalSize ─────────────────────────────────────────────────

/// Physical display size of the device in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalSize {
    pub width: u32,
    pub height: u32,
}

impl FromStr for PhysicalSize {
    type Err = CaptureError;

    /// Parse `"<width>x<height>"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once('x')
            .ok_or_else(|| CaptureError::Parse(format!("malformed size: {s:?}")))?;
        Ok(Self {
            width: w.trim().parse()?,
            height: h.trim().parse()?,
        })
    }
}

impl fmt::Display for PhysicalSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ── ProjectionParams ─────────────────────────────────────────────

/// Scale, rotation and JPEG quality passed to the capture helper.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionParams {
    /// Output scale relative to the physical size.
    pub zoom: f32,
    pub rotation: Rotation,
    /// JPEG quality, 0..=100.
    pub quality: u8,
}

impl Default for ProjectionParams {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            rotation: Rotation::Deg0,
            quality: 100,
        }
    }
}

impl ProjectionParams {
    pub fn validate(&self) -> Result<(), CaptureError> {
        if !self.zoom.is_finite() || self.zoom <= 0.0 {
            return Err(CaptureError::InvalidConfig("zoom must be a positive number"));
        }
        if self.quality > 100 {
            return Err(CaptureError::InvalidConfig("quality must be within 0..=100"));
        }
        Ok(())
    }

    /// Display projection `<w>x<h>@<scaled w>x<scaled h>/<rotation>`.
    pub fn projection(&self, size: PhysicalSize) -> String {
        let scale = |v: u32| (v as f32 * self.zoom).round() as u32;
        format!(
            "{}@{}x{}/{}",
            size,
            scale(size.width),
            scale(size.height),
            self.rotation
        )
    }
}

// ── ClientConfig ─────────────────────────────────────────────────

/// Configuration for [`CaptureClient`](crate::client::CaptureClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Frames buffered before the oldest is dropped.
    pub queue_capacity: usize,
    /// Reconnect after the stream ends instead of closing.
    pub reconnect: bool,
    pub retry_backoff: Duration,
    pub read_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reconnect: true,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            read_buffer_size: DEFAULT_READ_BUFFER,
        }
    }
}

impl ClientConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── ServerConfig ─────────────────────────────────────────────────

/// Configuration for [`CaptureServer`](crate::server::CaptureServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Local port forwarded to the helper socket.
    pub port: u16,
    pub params: ProjectionParams,
    pub poll_interval: Duration,
    pub command_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            params: ProjectionParams::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
