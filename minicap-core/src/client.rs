//! Client side of the capture stream.
//!
//! Connects to the forwarded helper socket, feeds every read through a
//! fresh [`FrameDecoder`] per connection, and buffers decoded frames in
//! a drop-oldest [`FrameQueue`] for a single consumer.
//!
//! ```text
//!  TcpStream ──read──► FrameDecoder ──push──► FrameQueue ──take──► consumer
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::decoder::{Banner, Frame, FrameDecoder};
use crate::error::CaptureError;
use crate::queue::FrameQueue;
use crate::state::{RunningState, StateCell};

// ── Shared ───────────────────────────────────────────────────────

/// State visible to both the reader task and public callers.
struct Shared {
    config: ClientConfig,
    state: StateCell,
    queue: FrameQueue,
    shutdown: CancellationToken,
    banner: Mutex<Option<Banner>>,
}

impl Shared {
    fn banner_slot(&self) -> MutexGuard<'_, Option<Banner>> {
        self.banner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ── CaptureClient ────────────────────────────────────────────────

/// Reads the helper's stream on a background task and hands out frames.
///
/// # Lifetime
///
/// `Ready → Starting` on [`start`](Self::start), `Running` while a
/// connection is streaming, back to `Starting` between reconnects, and
/// `Closed` after [`close`](Self::close) or when the stream ends with
/// reconnect disabled.
pub struct CaptureClient {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureClient {
    pub fn new(config: ClientConfig) -> Self {
        let queue = FrameQueue::new(config.queue_capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                state: StateCell::new(),
                queue,
                shutdown: CancellationToken::new(),
                banner: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn state(&self) -> RunningState {
        self.shared.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.is_running()
    }

    /// Banner of the current (or last) connection, once fully received.
    pub fn banner(&self) -> Option<Banner> {
        *self.shared.banner_slot()
    }

    /// Frames evicted because the consumer fell behind.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.queue.dropped()
    }

    /// Spawn the reader task. Must be called from a Tokio runtime.
    pub fn start(&self) -> Result<(), CaptureError> {
        self.shared.state.begin_start("start client")?;
        let handle = tokio::spawn(run(Arc::clone(&self.shared)));
        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(())
    }

    /// Wait for the next frame.
    ///
    /// Returns [`CaptureError::Cancelled`] if the client is closed while
    /// waiting, and an invalid-state fault if it is already closed.
    pub async fn take(&self) -> Result<Frame, CaptureError> {
        let state = self.shared.state.get();
        if state == RunningState::Closed {
            return Err(CaptureError::invalid_state("take frame", state));
        }
        self.shared.queue.take().await
    }

    /// Close the client: release the socket and cancel a pending `take`.
    ///
    /// Idempotent.
    pub fn close(&self) {
        if self.shared.state.close() != RunningState::Closed {
            info!("capture client closing");
        }
        self.shared.shutdown.cancel();
        self.shared.queue.close();
    }

    /// Resolve once the client has reached `Closed`.
    pub async fn wait_closed(&self) {
        self.shared
            .state
            .wait_for(|s| s == RunningState::Closed)
            .await;
    }
}

impl Drop for CaptureClient {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        self.shared.queue.close();
    }
}

// ── Reader task ──────────────────────────────────────────────────

async fn run(shared: Arc<Shared>) {
    let addr = shared.config.address();
    info!(%addr, "capture client starting");

    while !shared.shutdown.is_cancelled() {
        let connect = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            result = TcpStream::connect(&addr) => result,
        };

        let stream = match connect {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%addr, "failed to connect to capture helper, retrying: {e}");
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(shared.config.retry_backoff) => continue,
                }
            }
        };

        if !shared.state.mark_running() {
            break;
        }
        info!(%addr, "connected to capture helper");

        let outcome = read_stream(
            stream,
            shared.config.read_buffer_size,
            &shared.queue,
            &shared.shutdown,
            |banner| *shared.banner_slot() = Some(banner),
        )
        .await;

        let frames = match outcome {
            Ok(frames) => {
                info!(frames, "capture stream ended");
                frames
            }
            Err(e) => {
                warn!("capture stream error: {e}");
                0
            }
        };

        if shared.shutdown.is_cancelled() || !shared.config.reconnect {
            break;
        }
        shared.state.mark_restarting();

        // The forward accepts connections while the helper is down.
        if frames == 0 {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = tokio::time::sleep(shared.config.retry_backoff) => {}
            }
        }
    }

    shared.state.close();
    shared.shutdown.cancel();
    shared.queue.close();
    info!("capture client closed");
}

/// Pump one connection until end-of-stream or shutdown.
///
/// Returns the number of frames decoded. A partially received frame at
/// the end of the stream is discarded.
pub(crate) async fn read_stream<R, F>(
    mut reader: R,
    buffer_size: usize,
    queue: &FrameQueue,
    shutdown: &CancellationToken,
    mut on_banner: F,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    F: FnMut(Banner),
{
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut banner_seen = false;

    loop {
        let n = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            break;
        }

        decoder.feed(&buf[..n], |frame| queue.push(frame));

        if !banner_seen {
            if let Some(banner) = decoder.banner() {
                on_banner(*banner);
                banner_seen = true;
            }
        }
    }

    if decoder.partial_len() > 0 {
        debug!(bytes = decoder.partial_len(), "discarding partial frame");
    }
    Ok(decoder.frames_decoded())
}

// ── Tests ────────────────────────────────────────────────────────
