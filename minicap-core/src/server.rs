//! Device-side capture helper supervision.
//!
//! [`CaptureServer::start`] prepares the device (push helper binaries,
//! forward the socket) and then runs the helper command on a supervising
//! task. The server is `Running` only once the helper has printed its
//! first line of output.
//!
//! Restart and shutdown are cooperative: both raise a flag that the
//! helper's output monitor reports through [`OutputReceiver::is_cancelled`].
//! A helper that prints nothing is only interrupted once the device
//! bridge polls the monitor again or the command timeout elapses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::{PhysicalSize, ProjectionParams, Rotation, ServerConfig};
use crate::device::{DeviceBridge, OutputReceiver, REMOTE_DIR};
use crate::error::CaptureError;
use crate::state::{RunningState, StateCell};

// ── Shared ───────────────────────────────────────────────────────

struct Shared {
    device: Arc<dyn DeviceBridge>,
    port: u16,
    poll_interval: Duration,
    command_timeout: Duration,
    params: Mutex<ProjectionParams>,
    state: StateCell,
    stop: AtomicBool,
    restart: AtomicBool,
    abi: OnceCell<String>,
    api_level: OnceCell<u32>,
    size: OnceCell<PhysicalSize>,
}

impl Shared {
    fn params(&self) -> MutexGuard<'_, ProjectionParams> {
        self.params.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn abi(&self) -> Result<&str, CaptureError> {
        let abi = self
            .abi
            .get_or_try_init(|| self.device.query_abi())
            .await?;
        Ok(abi.as_str())
    }

    async fn api_level(&self) -> Result<u32, CaptureError> {
        Ok(*self
            .api_level
            .get_or_try_init(|| self.device.query_api_level())
            .await?)
    }

    async fn physical_size(&self) -> Result<PhysicalSize, CaptureError> {
        Ok(*self
            .size
            .get_or_try_init(|| self.device.query_physical_size())
            .await?)
    }

    async fn command(&self) -> Result<String, CaptureError> {
        let size = self.physical_size().await?;
        let params = *self.params();
        Ok(format!(
            "LD_LIBRARY_PATH={REMOTE_DIR} {REMOTE_DIR}/minicap -P {} -Q {}",
            params.projection(size),
            params.quality
        ))
    }
}

// ── HelperMonitor ────────────────────────────────────────────────

/// Output receiver for one helper invocation.
struct HelperMonitor<'a> {
    shared: &'a Shared,
    /// Set when this invocation was cancelled for a restart.
    restarting: bool,
}

impl OutputReceiver for HelperMonitor<'_> {
    fn add_output(&mut self, line: &str) {
        info!(target: "minicap::helper", "{line}");
        if self.shared.state.mark_running() {
            info!(serial = self.shared.device.serial(), "capture helper is running");
        }
    }

    fn is_cancelled(&mut self) -> bool {
        if self.shared.stop.load(Ordering::SeqCst) {
            return true;
        }
        if self.shared.restart.swap(false, Ordering::SeqCst) {
            self.restarting = true;
            return true;
        }
        false
    }
}

// ── CaptureServer ────────────────────────────────────────────────

/// Supervisor for the capture helper running on one device.
pub struct CaptureServer {
    shared: Arc<Shared>,
    start_guard: tokio::sync::Mutex<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureServer {
    pub fn new(device: Arc<dyn DeviceBridge>, config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                device,
                port: config.port,
                poll_interval: config.poll_interval,
                command_timeout: config.command_timeout,
                params: Mutex::new(config.params),
                state: StateCell::new(),
                stop: AtomicBool::new(false),
                restart: AtomicBool::new(false),
                abi: OnceCell::new(),
                api_level: OnceCell::new(),
                size: OnceCell::new(),
            }),
            start_guard: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
        }
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    pub fn state(&self) -> RunningState {
        self.shared.state.get()
    }

    /// `true` only while the helper is confirmed alive.
    pub fn is_running(&self) -> bool {
        self.shared.state.is_running()
    }

    /// `true` while starting, running, or relaunching the helper.
    pub fn is_alive(&self) -> bool {
        matches!(
            self.state(),
            RunningState::Starting | RunningState::Running
        )
    }

    // ── Configuration ────────────────────────────────────────────

    pub fn params(&self) -> ProjectionParams {
        *self.shared.params()
    }

    /// Replace all projection parameters; applied at the next (re)start.
    pub fn set_params(&self, params: ProjectionParams) -> Result<(), CaptureError> {
        params.validate()?;
        *self.shared.params() = params;
        Ok(())
    }

    pub fn set_zoom(&self, zoom: f32) -> Result<(), CaptureError> {
        self.set_params(ProjectionParams {
            zoom,
            ..self.params()
        })
    }

    /// Rotation in degrees: 0, 90, 180 or 270.
    pub fn set_rotate(&self, degrees: u16) -> Result<(), CaptureError> {
        let rotation = Rotation::try_from(degrees)?;
        self.set_params(ProjectionParams {
            rotation,
            ..self.params()
        })
    }

    pub fn set_quality(&self, quality: u8) -> Result<(), CaptureError> {
        self.set_params(ProjectionParams {
            quality,
            ..self.params()
        })
    }

    /// The helper invocation for the current parameters.
    pub async fn command(&self) -> Result<String, CaptureError> {
        self.shared.command().await
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Prepare the device and launch the supervising task.
    ///
    /// Preparation failures are returned here and leave the server
    /// `Ready`, so `start` may be retried.
    pub async fn start(&self) -> Result<(), CaptureError> {
        let _guard = self.start_guard.lock().await;
        let state = self.state();
        if state != RunningState::Ready {
            return Err(CaptureError::invalid_state("start server", state));
        }

        info!(serial = self.shared.device.serial(), "capture server starting");
        if let Err(e) = self.prepare().await {
            error!("capture server preparation failed: {e}");
            return Err(e);
        }

        if let Err(e) = self.shared.state.begin_start("start server") {
            // Closed while preparing.
            self.teardown().await;
            return Err(e);
        }

        let handle = tokio::spawn(supervise(Arc::clone(&self.shared)));
        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(())
    }

    async fn prepare(&self) -> Result<(), CaptureError> {
        let shared = &self.shared;
        let abi = shared.abi().await?;
        let api_level = shared.api_level().await?;
        shared.device.prepare_remote_environment(abi, api_level).await?;
        shared.device.establish_network_path(shared.port).await?;
        Ok(())
    }

    async fn teardown(&self) {
        if let Err(e) = self.shared.device.teardown_network_path(self.shared.port).await {
            warn!(port = self.shared.port, "failed to remove forward: {e}");
        }
    }

    /// Poll until the helper is confirmed running.
    ///
    /// Fails with [`CaptureError::NotStarted`] if the server is `Ready`,
    /// [`CaptureError::Closed`] once it is `Closed`, and
    /// [`CaptureError::Timeout`] (closing the server) after `timeout`.
    pub async fn wait_running(&self, timeout: Duration) -> Result<(), CaptureError> {
        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval(self.shared.poll_interval);
        loop {
            ticker.tick().await;
            match self.state() {
                RunningState::Running => return Ok(()),
                RunningState::Ready => return Err(CaptureError::NotStarted),
                RunningState::Closed => return Err(CaptureError::Closed),
                RunningState::Starting => {}
            }
            if Instant::now() >= deadline {
                warn!(?timeout, "capture helper did not start in time");
                self.close();
                self.shared.state.close();
                return Err(CaptureError::Timeout(timeout));
            }
        }
    }

    /// Relaunch the helper with the current parameters.
    ///
    /// The device is not prepared again and the forward stays in place.
    pub fn restart(&self) -> Result<(), CaptureError> {
        let state = self.state();
        if state != RunningState::Running {
            return Err(CaptureError::invalid_state("restart server", state));
        }
        info!("capture helper restart requested");
        self.shared.restart.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Ask the supervising task to stop the helper and remove the forward.
    ///
    /// A server that was never started closes immediately.
    pub fn close(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if self
            .shared
            .state
            .transition(RunningState::Ready, RunningState::Closed)
        {
            info!("capture server closed before start");
        }
    }

    /// Resolve once the server has reached `Closed`.
    pub async fn wait_closed(&self) {
        self.shared
            .state
            .wait_for(|s| s == RunningState::Closed)
            .await;
    }
}

impl Drop for CaptureServer {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }
}

// ── Supervising task ─────────────────────────────────────────────

async fn supervise(shared: Arc<Shared>) {
    while !shared.stop.load(Ordering::SeqCst) {
        let command = match shared.command().await {
            Ok(command) => command,
            Err(e) => {
                error!("cannot build capture helper command: {e}");
                break;
            }
        };
        info!(%command, "execute shell command");

        let mut monitor = HelperMonitor {
            shared: &shared,
            restarting: false,
        };
        let result = shared
            .device
            .run_remote_command(&command, &mut monitor, shared.command_timeout)
            .await;
        // A restart requested after the last poll still counts once the helper exits.
        let restarting = monitor.restarting || shared.restart.swap(false, Ordering::SeqCst);

        if let Err(e) = result {
            error!("capture helper failed: {e}");
        }
        if shared.stop.load(Ordering::SeqCst) || !restarting {
            break;
        }
        shared.state.mark_restarting();
        info!("relaunching capture helper");
    }

    if let Err(e) = shared.device.teardown_network_path(shared.port).await {
        warn!(port = shared.port, "failed to remove forward: {e}");
    }
    shared.state.close();
    info!("capture server closed");
}

// ── Tests ────────────────────────────────────────────────────────
