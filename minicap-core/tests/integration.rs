//! Integration tests: client, server and controller against a localhost
//! helper socket and an in-memory device bridge.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use minicap_core::{
    Banner, CaptureClient, CaptureError, CaptureServer, ClientConfig, DeviceBridge, Frame,
    OutputReceiver, PhysicalSize, ProjectionConfig, ProjectionController, RunningState,
    ServerConfig, SinkError,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(2);

// ── Helpers ──────────────────────────────────────────────────────

/// Listener on an OS-assigned port standing in for the forwarded socket.
async fn ephemeral_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn banner(pid: u32) -> Banner {
    Banner {
        version: 1,
        length: 24,
        pid,
        real_width: 1080,
        real_height: 1920,
        virtual_width: 1080,
        virtual_height: 1920,
        orientation: 0,
        quirks: 0,
    }
}

/// Accept one connection and write a banner plus `frames` in 7-byte writes.
async fn serve_once(listener: &TcpListener, pid: u32, frames: &[&[u8]]) -> TcpStream {
    let (mut sock, _) = listener.accept().await.unwrap();
    let mut wire = banner(pid).encode().to_vec();
    for frame in frames {
        wire.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        wire.extend_from_slice(frame);
    }
    for chunk in wire.chunks(7) {
        sock.write_all(chunk).await.unwrap();
    }
    sock.flush().await.unwrap();
    sock
}

/// Write one length-prefixed frame on an open helper connection.
async fn send_frame(sock: &mut TcpStream, payload: &[u8]) {
    sock.write_all(&(payload.len() as u32).to_le_bytes()).await.unwrap();
    sock.write_all(payload).await.unwrap();
    sock.flush().await.unwrap();
}

fn client_config(port: u16, reconnect: bool) -> ClientConfig {
    ClientConfig {
        port,
        reconnect,
        retry_backoff: Duration::from_millis(20),
        ..ClientConfig::default()
    }
}

fn server_config(port: u16) -> ServerConfig {
    ServerConfig {
        port,
        poll_interval: Duration::from_millis(10),
        ..ServerConfig::default()
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    timeout(WAIT, async {
        while !cond() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

// ── FakeDevice ───────────────────────────────────────────────────

/// Device bridge that records calls and keeps a "helper" alive until
/// the receiver cancels it.
#[derive(Default)]
struct FakeDevice {
    fail_prepare: bool,
    /// Never produce helper output.
    silent: bool,
    commands: Mutex<Vec<String>>,
    prepared: AtomicUsize,
    forwarded: AtomicUsize,
    removed: AtomicUsize,
}

impl FakeDevice {
    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceBridge for FakeDevice {
    fn serial(&self) -> &str {
        "fake"
    }

    async fn query_abi(&self) -> Result<String, CaptureError> {
        Ok("arm64-v8a".into())
    }

    async fn query_api_level(&self) -> Result<u32, CaptureError> {
        Ok(29)
    }

    async fn query_physical_size(&self) -> Result<PhysicalSize, CaptureError> {
        Ok(PhysicalSize {
            width: 1080,
            height: 1920,
        })
    }

    async fn prepare_remote_environment(
        &self,
        _abi: &str,
        _api_level: u32,
    ) -> Result<(), CaptureError> {
        if self.fail_prepare {
            return Err(CaptureError::Device("push failed: permission denied".into()));
        }
        self.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn establish_network_path(&self, _port: u16) -> Result<(), CaptureError> {
        self.forwarded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn teardown_network_path(&self, _port: u16) -> Result<(), CaptureError> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run_remote_command(
        &self,
        command: &str,
        receiver: &mut dyn OutputReceiver,
        limit: Duration,
    ) -> Result<(), CaptureError> {
        self.commands.lock().unwrap().push(command.to_string());
        if !self.silent {
            receiver.add_output("PID: 100");
        }
        let run = async {
            while !receiver.is_cancelled() {
                sleep(Duration::from_millis(5)).await;
            }
        };
        timeout(limit, run)
            .await
            .map_err(|_| CaptureError::Timeout(limit))
    }
}

// ── CaptureClient ────────────────────────────────────────────────

#[tokio::test]
async fn client_decodes_frames_from_socket() {
    let (listener, port) = ephemeral_listener().await;
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let helper = tokio::spawn(async move {
        let sock = serve_once(&listener, 100, &[&[0xAA; 10][..], &[0xBB; 5][..]]).await;
        let _ = release_rx.await;
        drop(sock);
    });

    let client = CaptureClient::new(client_config(port, false));
    client.start().unwrap();

    let first = timeout(WAIT, client.take()).await.expect("timeout").unwrap();
    let second = timeout(WAIT, client.take()).await.expect("timeout").unwrap();
    assert_eq!(&first[..], &[0xAA; 10]);
    assert_eq!(&second[..], &[0xBB; 5]);
    assert_eq!(client.banner(), Some(banner(100)));
    assert_eq!(client.state(), RunningState::Running);

    // End of stream without reconnect closes the client.
    release_tx.send(()).unwrap();
    timeout(WAIT, client.wait_closed()).await.expect("client did not close");
    assert!(matches!(
        client.take().await,
        Err(CaptureError::InvalidState { .. })
    ));
    helper.await.unwrap();
}

#[tokio::test]
async fn client_reconnects_with_fresh_decoder() {
    let (listener, port) = ephemeral_listener().await;
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let helper = tokio::spawn(async move {
        let first = serve_once(&listener, 1, &[b"one"]).await;
        drop(first);
        let second = serve_once(&listener, 2, &[b"two"]).await;
        let _ = release_rx.await;
        drop(second);
    });

    let client = CaptureClient::new(client_config(port, true));
    client.start().unwrap();

    let one = timeout(WAIT, client.take()).await.expect("timeout").unwrap();
    let two = timeout(WAIT, client.take()).await.expect("timeout").unwrap();
    assert_eq!(&one[..], b"one");
    assert_eq!(&two[..], b"two");
    assert_eq!(client.banner().map(|b| b.pid), Some(2));

    client.close();
    release_tx.send(()).unwrap();
    timeout(WAIT, client.wait_closed()).await.expect("client did not close");
    helper.await.unwrap();
}

#[tokio::test]
async fn client_retries_until_helper_listens() {
    // Reserve a port, release it, then start listening after the client.
    let (listener, port) = ephemeral_listener().await;
    drop(listener);

    let client = CaptureClient::new(client_config(port, false));
    client.start().unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(client.state(), RunningState::Starting);

    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let helper = tokio::spawn(async move {
        let sock = serve_once(&listener, 7, &[b"late"]).await;
        sleep(Duration::from_millis(200)).await;
        drop(sock);
    });

    let frame = timeout(WAIT, client.take()).await.expect("timeout").unwrap();
    assert_eq!(&frame[..], b"late");
    client.close();
    helper.await.unwrap();
}

#[tokio::test]
async fn client_backs_off_after_empty_stream() {
    let (listener, port) = ephemeral_listener().await;
    let accepted = Arc::new(AtomicUsize::new(0));
    let helper = {
        let accepted = Arc::clone(&accepted);
        tokio::spawn(async move {
            // Forward is up but the helper is not: accept and hang up at once.
            loop {
                let (sock, _) = listener.accept().await.unwrap();
                accepted.fetch_add(1, Ordering::SeqCst);
                drop(sock);
            }
        })
    };

    let client = CaptureClient::new(ClientConfig {
        port,
        reconnect: true,
        retry_backoff: Duration::from_millis(50),
        ..ClientConfig::default()
    });
    client.start().unwrap();
    sleep(Duration::from_millis(220)).await;
    client.close();
    helper.abort();

    let attempts = accepted.load(Ordering::SeqCst);
    assert!(attempts >= 2, "client did not reconnect: {attempts}");
    assert!(attempts <= 6, "client reconnected without backoff: {attempts}");
}

// ── CaptureServer ────────────────────────────────────────────────

#[tokio::test]
async fn server_start_run_close() {
    let device = Arc::new(FakeDevice::default());
    let server = CaptureServer::new(device.clone(), server_config(1717));

    server.start().await.unwrap();
    server.wait_running(WAIT).await.unwrap();
    assert!(server.is_running());
    assert_eq!(device.prepared.load(Ordering::SeqCst), 1);
    assert_eq!(device.forwarded.load(Ordering::SeqCst), 1);
    assert_eq!(
        device.commands(),
        vec!["LD_LIBRARY_PATH=/data/local/tmp /data/local/tmp/minicap -P 1080x1920@1080x1920/0 -Q 100"]
    );

    assert!(matches!(
        server.start().await,
        Err(CaptureError::InvalidState { .. })
    ));

    server.close();
    timeout(WAIT, server.wait_closed()).await.expect("server did not close");
    assert_eq!(device.removed.load(Ordering::SeqCst), 1);
    assert!(server.restart().is_err());
}

#[tokio::test]
async fn server_restart_applies_new_params() {
    let device = Arc::new(FakeDevice::default());
    let server = CaptureServer::new(device.clone(), server_config(1717));
    server.start().await.unwrap();
    server.wait_running(WAIT).await.unwrap();

    server.set_zoom(0.5).unwrap();
    server.set_rotate(90).unwrap();
    server.restart().unwrap();

    eventually("helper relaunch", || device.commands().len() == 2).await;
    server.wait_running(WAIT).await.unwrap();
    assert!(device.commands()[1].ends_with("-P 1080x1920@540x960/90 -Q 100"));
    // Relaunch reuses the prepared device and the existing forward.
    assert_eq!(device.prepared.load(Ordering::SeqCst), 1);
    assert_eq!(device.forwarded.load(Ordering::SeqCst), 1);

    server.close();
    timeout(WAIT, server.wait_closed()).await.expect("server did not close");
}

#[tokio::test]
async fn server_preparation_failure_stays_ready() {
    let device = Arc::new(FakeDevice {
        fail_prepare: true,
        ..FakeDevice::default()
    });
    let server = CaptureServer::new(device.clone(), server_config(1717));

    assert!(matches!(server.start().await, Err(CaptureError::Device(_))));
    assert_eq!(server.state(), RunningState::Ready);
    assert_eq!(device.forwarded.load(Ordering::SeqCst), 0);
    assert!(device.commands().is_empty());
    assert!(matches!(
        server.wait_running(WAIT).await,
        Err(CaptureError::NotStarted)
    ));
}

#[tokio::test]
async fn silent_helper_times_out_and_closes() {
    let device = Arc::new(FakeDevice {
        silent: true,
        ..FakeDevice::default()
    });
    let server = CaptureServer::new(device.clone(), server_config(1717));
    server.start().await.unwrap();

    let result = server.wait_running(Duration::from_millis(60)).await;
    assert!(matches!(result, Err(CaptureError::Timeout(_))));
    assert_eq!(server.state(), RunningState::Closed);
    eventually("forward removal", || device.removed.load(Ordering::SeqCst) == 1).await;
}

// ── ProjectionController ─────────────────────────────────────────

#[tokio::test]
async fn controller_relays_frames_to_sink() {
    let (listener, port) = ephemeral_listener().await;
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let helper = tokio::spawn(async move {
        let sock = serve_once(&listener, 100, &[b"frame-1", b"frame-2"]).await;
        let _ = release_rx.await;
        drop(sock);
    });

    let device = Arc::new(FakeDevice::default());
    let mut config = ProjectionConfig::with_port(port);
    config.client.retry_backoff = Duration::from_millis(20);
    config.server.poll_interval = Duration::from_millis(10);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = move |frame: Frame| -> Result<(), SinkError> {
        tx.send(frame)?;
        Ok(())
    };

    let controller = ProjectionController::new(device.clone(), config, sink);
    controller.set_quality(80).unwrap();
    controller.start().await.unwrap();

    let first = timeout(WAIT, rx.recv()).await.expect("timeout").unwrap();
    let second = timeout(WAIT, rx.recv()).await.expect("timeout").unwrap();
    assert_eq!(&first[..], b"frame-1");
    assert_eq!(&second[..], b"frame-2");
    assert_eq!(controller.banner().map(|b| b.pid), Some(100));
    assert!(device.commands()[0].ends_with("-Q 80"));

    assert!(controller.start().await.is_err());

    controller.close();
    timeout(WAIT, controller.join()).await.expect("relay did not stop");
    timeout(WAIT, controller.server().wait_closed())
        .await
        .expect("server did not close");
    assert_eq!(controller.client().state(), RunningState::Closed);
    assert_eq!(device.removed.load(Ordering::SeqCst), 1);

    let _ = release_tx.send(());
    helper.await.unwrap();
}

#[tokio::test]
async fn controller_surfaces_preparation_failure() {
    let device = Arc::new(FakeDevice {
        fail_prepare: true,
        ..FakeDevice::default()
    });
    let controller = ProjectionController::new(
        device,
        ProjectionConfig::default(),
        |_frame: Frame| -> Result<(), SinkError> { Ok(()) },
    );

    assert!(matches!(
        controller.start().await,
        Err(CaptureError::Device(_))
    ));
    assert_eq!(controller.client().state(), RunningState::Ready);
    controller.join().await;
}

#[tokio::test]
async fn controller_rejects_invalid_params() {
    let controller = ProjectionController::new(
        Arc::new(FakeDevice::default()),
        ProjectionConfig::default(),
        |_frame: Frame| -> Result<(), SinkError> { Ok(()) },
    );
    assert!(controller.set_zoom(-1.0).is_err());
    assert!(controller.set_rotate(45).is_err());
    assert!(controller.set_quality(101).is_err());
    assert_eq!(controller.params().quality, 100);
}

#[tokio::test]
async fn controller_survives_sink_errors() {
    let (listener, port) = ephemeral_listener().await;
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let helper = tokio::spawn(async move {
        let sock = serve_once(&listener, 100, &[b"frame-1", b"frame-2", b"frame-3"]).await;
        let _ = release_rx.await;
        drop(sock);
    });

    let mut config = ProjectionConfig::with_port(port);
    config.client.retry_backoff = Duration::from_millis(20);
    config.server.poll_interval = Duration::from_millis(10);

    // The first frame fails to write; the rest go through.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut calls = 0usize;
    let sink = move |frame: Frame| -> Result<(), SinkError> {
        calls += 1;
        if calls == 1 {
            return Err("disk full".into());
        }
        tx.send(frame)?;
        Ok(())
    };

    let controller = ProjectionController::new(Arc::new(FakeDevice::default()), config, sink);
    controller.start().await.unwrap();

    let second = timeout(WAIT, rx.recv()).await.expect("timeout").unwrap();
    let third = timeout(WAIT, rx.recv()).await.expect("timeout").unwrap();
    assert_eq!(&second[..], b"frame-2");
    assert_eq!(&third[..], b"frame-3");
    assert!(controller.server().is_running());

    controller.close();
    timeout(WAIT, controller.join()).await.expect("relay did not stop");
    let _ = release_tx.send(());
    helper.await.unwrap();
}

#[tokio::test]
async fn controller_restart_relaunches_with_new_params() {
    let (listener, port) = ephemeral_listener().await;
    let (more_tx, more_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let helper = tokio::spawn(async move {
        let mut sock = serve_once(&listener, 100, &[b"before"]).await;
        let _ = more_rx.await;
        send_frame(&mut sock, b"after").await;
        let _ = release_rx.await;
        drop(sock);
    });

    let device = Arc::new(FakeDevice::default());
    let mut config = ProjectionConfig::with_port(port);
    config.client.retry_backoff = Duration::from_millis(20);
    config.server.poll_interval = Duration::from_millis(10);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = move |frame: Frame| -> Result<(), SinkError> {
        tx.send(frame)?;
        Ok(())
    };

    let controller = ProjectionController::new(device.clone(), config, sink);
    controller.start().await.unwrap();
    let before = timeout(WAIT, rx.recv()).await.expect("timeout").unwrap();
    assert_eq!(&before[..], b"before");

    controller.set_zoom(0.5).unwrap();
    controller.set_rotate(90).unwrap();
    controller.set_quality(60).unwrap();
    controller.restart().unwrap();

    eventually("helper relaunch", || device.commands().len() == 2).await;
    assert!(device.commands()[1].ends_with("-P 1080x1920@540x960/90 -Q 60"));
    controller.server().wait_running(WAIT).await.unwrap();
    assert_eq!(device.prepared.load(Ordering::SeqCst), 1);

    // The client connection is untouched by the relaunch.
    more_tx.send(()).unwrap();
    let after = timeout(WAIT, rx.recv()).await.expect("timeout").unwrap();
    assert_eq!(&after[..], b"after");
    assert_eq!(controller.client().state(), RunningState::Running);

    controller.close();
    timeout(WAIT, controller.join()).await.expect("relay did not stop");
    let _ = release_tx.send(());
    helper.await.unwrap();
}
