//! Screen projection: one capture server plus one capture client.
//!
//! [`ProjectionController::start`] brings the helper up on the device,
//! waits until it is confirmed running, connects the client, and spawns a
//! relay task that hands every decoded frame to a caller-supplied
//! [`FrameSink`].

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::CaptureClient;
use crate::config::{ClientConfig, DEFAULT_PORT, ProjectionParams, Rotation, ServerConfig};
use crate::decoder::{Banner, Frame};
use crate::device::DeviceBridge;
use crate::error::CaptureError;
use crate::server::CaptureServer;
use crate::state::RunningState;

/// How long `start` waits for the helper's first output.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type a sink may return; it is logged and otherwise ignored.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

// ── FrameSink ────────────────────────────────────────────────────

/// Destination for decoded frames.
pub trait FrameSink: Send + 'static {
    fn on_frame(&mut self, frame: Frame) -> Result<(), SinkError>;
}

impl<F> FrameSink for F
where
    F: FnMut(Frame) -> Result<(), SinkError> + Send + 'static,
{
    fn on_frame(&mut self, frame: Frame) -> Result<(), SinkError> {
        self(frame)
    }
}

// ── ProjectionConfig ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProjectionConfig {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub start_timeout: Duration,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self::with_port(DEFAULT_PORT)
    }
}

impl ProjectionConfig {
    /// Defaults with client and server sharing `port`.
    pub fn with_port(port: u16) -> Self {
        Self {
            client: ClientConfig {
                port,
                ..ClientConfig::default()
            },
            server: ServerConfig {
                port,
                ..ServerConfig::default()
            },
            start_timeout: DEFAULT_START_TIMEOUT,
        }
    }
}

// ── ProjectionController ─────────────────────────────────────────

pub struct ProjectionController {
    server: Arc<CaptureServer>,
    client: Arc<CaptureClient>,
    /// Parameters pushed to the server on the next start or restart.
    params: Mutex<ProjectionParams>,
    sink: Mutex<Option<Box<dyn FrameSink>>>,
    start_timeout: Duration,
    relay: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ProjectionController {
    pub fn new<S>(device: Arc<dyn DeviceBridge>, config: ProjectionConfig, sink: S) -> Self
    where
        S: FrameSink,
    {
        let params = config.server.params;
        Self {
            server: Arc::new(CaptureServer::new(device, config.server)),
            client: Arc::new(CaptureClient::new(config.client)),
            params: Mutex::new(params),
            sink: Mutex::new(Some(Box::new(sink))),
            start_timeout: config.start_timeout,
            relay: tokio::sync::Mutex::new(None),
        }
    }

    pub fn server(&self) -> &CaptureServer {
        &self.server
    }

    pub fn client(&self) -> &CaptureClient {
        &self.client
    }

    /// Banner of the current stream, once received.
    pub fn banner(&self) -> Option<Banner> {
        self.client.banner()
    }

    fn params_lock(&self) -> MutexGuard<'_, ProjectionParams> {
        self.params.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn params(&self) -> ProjectionParams {
        *self.params_lock()
    }

    fn update(&self, next: ProjectionParams) -> Result<(), CaptureError> {
        next.validate()?;
        *self.params_lock() = next;
        Ok(())
    }

    /// Scale factor; takes effect on the next start or restart.
    pub fn set_zoom(&self, zoom: f32) -> Result<(), CaptureError> {
        self.update(ProjectionParams {
            zoom,
            ..self.params()
        })
    }

    /// Rotation in degrees (0, 90, 180, 270); takes effect on restart.
    pub fn set_rotate(&self, degrees: u16) -> Result<(), CaptureError> {
        self.update(ProjectionParams {
            rotation: Rotation::try_from(degrees)?,
            ..self.params()
        })
    }

    /// JPEG quality (0..=100); takes effect on restart.
    pub fn set_quality(&self, quality: u8) -> Result<(), CaptureError> {
        self.update(ProjectionParams {
            quality,
            ..self.params()
        })
    }

    /// Start the server, wait for the helper, connect the client and
    /// begin relaying frames to the sink.
    pub async fn start(&self) -> Result<(), CaptureError> {
        self.server.set_params(self.params())?;
        self.server.start().await?;

        if let Err(e) = self.server.wait_running(self.start_timeout).await {
            self.close();
            return Err(e);
        }
        if let Err(e) = self.client.start() {
            self.close();
            return Err(e);
        }

        let sink = self
            .sink
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| CaptureError::invalid_state("start projection", RunningState::Closed))?;

        let handle = tokio::spawn(relay(
            Arc::clone(&self.server),
            Arc::clone(&self.client),
            sink,
        ));
        *self.relay.lock().await = Some(handle);
        info!("screen projection started");
        Ok(())
    }

    /// Push the current parameters to the server and relaunch the helper.
    ///
    /// The client keeps its connection settings and reconnects on its own.
    pub fn restart(&self) -> Result<(), CaptureError> {
        self.server.set_params(self.params())?;
        self.server.restart()
    }

    /// Close the client and ask the server to shut down.
    pub fn close(&self) {
        self.client.close();
        self.server.close();
    }

    /// Wait for the relay task to finish after `close` or a helper exit.
    pub async fn join(&self) {
        let handle = self.relay.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("frame relay task failed: {e}");
            }
        }
    }
}

// ── Relay task ───────────────────────────────────────────────────

async fn relay(server: Arc<CaptureServer>, client: Arc<CaptureClient>, mut sink: Box<dyn FrameSink>) {
    let mut delivered: u64 = 0;

    while server.is_alive() {
        let frame = tokio::select! {
            frame = client.take() => frame,
            _ = server.wait_closed() => break,
        };

        match frame {
            Ok(frame) => {
                delivered += 1;
                if let Err(e) = sink.on_frame(frame) {
                    warn!("frame sink failed: {e}");
                }
            }
            Err(e) => {
                debug!("frame relay stopping: {e}");
                break;
            }
        }
    }

    client.close();
    server.close();
    info!(delivered, dropped = client.dropped_frames(), "screen projection stopped");
}

// ── Tests ────────────────────────────────────────────────────────
