//! # minicap-core
//!
//! Screen mirroring for devices running the minicap capture helper.
//!
//! This crate contains:
//! - **Decoder**: `FrameDecoder` for the banner-prefixed, length-framed JPEG stream
//! - **Queue**: `FrameQueue`, a bounded drop-oldest buffer with async `take`
//! - **Client**: `CaptureClient` reading the forwarded socket on a background task
//! - **Server**: `CaptureServer` preparing the device and supervising the helper
//! - **Controller**: `ProjectionController` wiring both to a `FrameSink`
//! - **Device**: the `DeviceBridge` seam and its adb-backed implementation
//! - **State**: `RunningState` lifecycle shared by client and server
//! - **Error**: `CaptureError`, a `thiserror`-based error type

pub mod client;
pub mod config;
pub mod controller;
pub mod decoder;
pub mod device;
pub mod error;
pub mod queue;
pub mod server;
pub mod state;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use client::CaptureClient;
pub use config::{
    ClientConfig, DEFAULT_PORT, PhysicalSize, ProjectionParams, Rotation, ServerConfig,
};
pub use controller::{
    DEFAULT_START_TIMEOUT, FrameSink, ProjectionConfig, ProjectionController, SinkError,
};
pub use decoder::{BANNER_SIZE, Banner, Frame, FrameDecoder};
pub use device::{AdbConfig, AdbDevice, DeviceBridge, OutputReceiver};
pub use error::CaptureError;
pub use queue::{DEFAULT_QUEUE_CAPACITY, FrameQueue};
pub use server::CaptureServer;
pub use state::RunningState;
