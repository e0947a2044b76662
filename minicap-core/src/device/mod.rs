//! Device-side collaborators used by the capture server.
//!
//! The server never talks to a device directly; everything goes through
//! a [`DeviceBridge`]. [`AdbDevice`] implements it on top of the `adb`
//! command-line tool.

pub mod adb;

use std::time::Duration;

use async_trait::async_trait;

use crate::config::PhysicalSize;
use crate::error::CaptureError;

pub use adb::{AdbConfig, AdbDevice, REMOTE_DIR};

/// Receives the output of a remote shell command.
///
/// `is_cancelled` is polled by the command runner after every batch of
/// output; returning `true` asks the runner to stop the command early.
pub trait OutputReceiver: Send {
    /// One line of output, without the trailing newline.
    fn add_output(&mut self, line: &str);

    fn is_cancelled(&mut self) -> bool;
}

/// Operations the capture server needs from the target device.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Human-readable device identifier for logs.
    fn serial(&self) -> &str;

    /// CPU ABI, e.g. `arm64-v8a`.
    async fn query_abi(&self) -> Result<String, CaptureError>;

    /// SDK API level, e.g. `29`.
    async fn query_api_level(&self) -> Result<u32, CaptureError>;

    async fn query_physical_size(&self) -> Result<PhysicalSize, CaptureError>;

    /// Push the helper binaries for `abi`/`api_level` and make them executable.
    async fn prepare_remote_environment(
        &self,
        abi: &str,
        api_level: u32,
    ) -> Result<(), CaptureError>;

    /// Forward local `port` to the helper's socket on the device.
    async fn establish_network_path(&self, port: u16) -> Result<(), CaptureError>;

    async fn teardown_network_path(&self, port: u16) -> Result<(), CaptureError>;

    /// Run `command` on the device, streaming its output to `receiver`.
    ///
    /// Returns when the command exits, when `receiver` reports
    /// cancellation, or when `timeout` elapses (as [`CaptureError::Timeout`]).
    async fn run_remote_command(
        &self,
        command: &str,
        receiver: &mut dyn OutputReceiver,
        timeout: Duration,
    ) -> Result<(), CaptureError>;
}
