//! [`DeviceBridge`] backed by the `adb` executable.
//!
//! Every operation is a one-shot `adb -s <serial> ...` invocation run
//! through `tokio::process`, except [`run_remote_command`] which keeps
//! the shell open and streams its output line by line.
//!
//! [`run_remote_command`]: DeviceBridge::run_remote_command

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::PhysicalSize;
use crate::device::{DeviceBridge, OutputReceiver};
use crate::error::CaptureError;

/// Device directory the helper binaries are pushed to.
pub const REMOTE_DIR: &str = "/data/local/tmp";

/// Abstract socket name the helper listens on.
pub const SOCKET_NAME: &str = "minicap";

/// Permission applied to pushed helper files.
const HELPER_MODE: &str = "777";

const SIZE_MARKER: &str = "Physical size: ";

// ── AdbConfig ────────────────────────────────────────────────────

/// How to reach a device through adb.
#[derive(Debug, Clone)]
pub struct AdbConfig {
    /// Path to (or name of) the `adb` executable.
    pub adb_path: PathBuf,
    /// Device serial passed as `-s`.
    pub serial: String,
    /// Local directory holding `bin/<abi>/` and `shared/android-<api>/<abi>/`.
    pub resource_dir: PathBuf,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            serial: String::new(),
            resource_dir: PathBuf::from("minicap"),
        }
    }
}

// ── AdbDevice ────────────────────────────────────────────────────

pub struct AdbDevice {
    config: AdbConfig,
}

impl AdbDevice {
    pub fn new(config: AdbConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.adb_path);
        if !self.config.serial.is_empty() {
            cmd.arg("-s").arg(&self.config.serial);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Run `adb <args>` to completion and return its trimmed stdout.
    async fn adb<I, S>(&self, args: I) -> Result<String, CaptureError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command();
        cmd.args(args);
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(CaptureError::Device(format!(
                "adb exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn shell(&self, command: &str) -> Result<String, CaptureError> {
        debug!(serial = %self.config.serial, command, "adb shell");
        self.adb(["shell", command]).await
    }

    /// Push `local` to `remote` and chmod it; any chmod output is a failure.
    async fn push_file(&self, local: &Path, remote: &str) -> Result<(), CaptureError> {
        info!(local = %local.display(), remote, "push file");
        let mut cmd = self.command();
        cmd.arg("push").arg(local).arg(remote);
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(CaptureError::Device(format!(
                "push {} failed: {}",
                local.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let chmod = self
            .shell(&format!("chmod {HELPER_MODE} {remote}"))
            .await?;
        if !chmod.is_empty() {
            return Err(CaptureError::Device(chmod));
        }
        Ok(())
    }
}

/// Local helper files and their destinations on the device.
pub fn helper_files(resource_dir: &Path, abi: &str, api_level: u32) -> Vec<(PathBuf, String)> {
    let bin = resource_dir.join("bin").join(abi);
    vec![
        (bin.join("minicap"), format!("{REMOTE_DIR}/minicap")),
        (bin.join("minicap-nopie"), format!("{REMOTE_DIR}/minicap-nopie")),
        (
            resource_dir
                .join("shared")
                .join(format!("android-{api_level}"))
                .join(abi)
                .join("minicap.so"),
            format!("{REMOTE_DIR}/minicap.so"),
        ),
    ]
}

/// Extract the physical size from `wm size` output.
pub fn parse_wm_size(output: &str) -> Result<PhysicalSize, CaptureError> {
    let rest = output
        .split_once(SIZE_MARKER)
        .map(|(_, rest)| rest)
        .ok_or_else(|| CaptureError::Parse(format!("unexpected wm size output: {output:?}")))?;
    rest.lines().next().unwrap_or_default().parse()
}

#[async_trait]
impl DeviceBridge for AdbDevice {
    fn serial(&self) -> &str {
        &self.config.serial
    }

    async fn query_abi(&self) -> Result<String, CaptureError> {
        self.shell("getprop ro.product.cpu.abi").await
    }

    async fn query_api_level(&self) -> Result<u32, CaptureError> {
        Ok(self.shell("getprop ro.build.version.sdk").await?.parse::<u32>()?)
    }

    async fn query_physical_size(&self) -> Result<PhysicalSize, CaptureError> {
        parse_wm_size(&self.shell("wm size").await?)
    }

    async fn prepare_remote_environment(
        &self,
        abi: &str,
        api_level: u32,
    ) -> Result<(), CaptureError> {
        for (local, remote) in helper_files(&self.config.resource_dir, abi, api_level) {
            self.push_file(&local, &remote).await?;
        }
        Ok(())
    }

    async fn establish_network_path(&self, port: u16) -> Result<(), CaptureError> {
        self.adb([
            "forward".to_string(),
            format!("tcp:{port}"),
            format!("localabstract:{SOCKET_NAME}"),
        ])
        .await?;
        info!(port, "forward tcp:{port} localabstract:{SOCKET_NAME}");
        Ok(())
    }

    async fn teardown_network_path(&self, port: u16) -> Result<(), CaptureError> {
        self.adb(["forward".to_string(), "--remove".to_string(), format!("tcp:{port}")])
            .await?;
        Ok(())
    }

    async fn run_remote_command(
        &self,
        command: &str,
        receiver: &mut dyn OutputReceiver,
        timeout: Duration,
    ) -> Result<(), CaptureError> {
        let mut child = self
            .command()
            .arg("shell")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Device("adb shell has no stdout".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let monitor = async {
            while let Some(line) = lines.next_line().await? {
                let line = line.trim();
                if !line.is_empty() {
                    receiver.add_output(line);
                }
                if receiver.is_cancelled() {
                    return Ok(true);
                }
            }
            Ok::<bool, std::io::Error>(false)
        };

        match tokio::time::timeout(timeout, monitor).await {
            Ok(Ok(true)) => {
                debug!(command, "remote command cancelled");
                child.kill().await?;
                Ok(())
            }
            Ok(Ok(false)) => {
                let status = child.wait().await?;
                debug!(command, %status, "remote command exited");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                Err(e.into())
            }
            Err(_) => {
                let _ = child.kill().await;
                Err(CaptureError::Timeout(timeout))
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
