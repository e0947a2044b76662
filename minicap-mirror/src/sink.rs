//! Frame sink that keeps the latest frame on disk.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::info;

use minicap_core::{Frame, FrameSink, SinkError};

// ── FrameStats ───────────────────────────────────────────────────

/// Throughput over one reporting window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub frames: u64,
    pub bytes: u64,
    pub fps: f64,
}

/// Counts frames and reports once per interval.
#[derive(Debug)]
pub struct FrameStats {
    interval: Duration,
    window_start: Instant,
    frames: u64,
    bytes: u64,
}

impl FrameStats {
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(interval, Instant::now())
    }

    fn starting_at(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            window_start: now,
            frames: 0,
            bytes: 0,
        }
    }

    /// Record one frame; returns the window summary once `interval` has passed.
    pub fn record(&mut self, bytes: usize) -> Option<Throughput> {
        self.record_at(Instant::now(), bytes)
    }

    fn record_at(&mut self, now: Instant, bytes: usize) -> Option<Throughput> {
        self.frames += 1;
        self.bytes += bytes as u64;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.interval {
            return None;
        }
        let summary = Throughput {
            frames: self.frames,
            bytes: self.bytes,
            fps: self.frames as f64 / elapsed.as_secs_f64(),
        };
        self.window_start = now;
        self.frames = 0;
        self.bytes = 0;
        Some(summary)
    }
}

// ── FrameWriter ──────────────────────────────────────────────────

/// Writes every frame to `path`, replacing the previous one atomically.
pub struct FrameWriter {
    path: PathBuf,
    staging: PathBuf,
    stats: FrameStats,
}

impl FrameWriter {
    pub fn new(path: impl Into<PathBuf>, stats_interval: Duration) -> Self {
        let path = path.into();
        let mut staging = path.clone().into_os_string();
        staging.push(".part");
        Self {
            path,
            staging: staging.into(),
            stats: FrameStats::new(stats_interval),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, frame: &[u8]) -> std::io::Result<()> {
        let write = || -> std::io::Result<()> {
            std::fs::write(&self.staging, frame)?;
            std::fs::rename(&self.staging, &self.path)
        };
        // The relay calls sinks from a runtime worker; keep file I/O off it.
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(write)
            }
            _ => write(),
        }
    }
}

impl FrameSink for FrameWriter {
    fn on_frame(&mut self, frame: Frame) -> Result<(), SinkError> {
        self.write(&frame)?;
        if let Some(t) = self.stats.record(frame.len()) {
            info!(
                frames = t.frames,
                kib = t.bytes / 1024,
                "{:.1} fps",
                t.fps
            );
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
