//! minicap-mirror entry point.
//!
//! ```text
//! minicap-mirror                      Mirror the default adb device
//! minicap-mirror --serial <serial>    Pick a device
//! minicap-mirror --zoom 0.5 --rotate 90 --quality 80
//! minicap-mirror --output <path>      File that holds the latest frame
//! minicap-mirror --config <path>      Load a custom config TOML
//! minicap-mirror --gen-config         Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use minicap_core::{AdbDevice, ProjectionController};
use minicap_mirror::config::MirrorConfig;
use minicap_mirror::sink::FrameWriter;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "minicap-mirror", about = "Mirror an Android screen through minicap")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "minicap-mirror.toml")]
    config: PathBuf,

    /// Device serial (overrides `[device] serial`).
    #[arg(short, long)]
    serial: Option<String>,

    /// Output scale relative to the physical display.
    #[arg(long)]
    zoom: Option<f32>,

    /// Rotation in degrees: 0, 90, 180 or 270.
    #[arg(long)]
    rotate: Option<u16>,

    /// JPEG quality, 0-100.
    #[arg(long)]
    quality: Option<u8>,

    /// File that always holds the latest frame.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&MirrorConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = MirrorConfig::load(&cli.config);
    if let Some(serial) = cli.serial {
        config.device.serial = serial;
    }
    if let Some(output) = cli.output {
        config.output.path = output;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("minicap-mirror v{}", env!("CARGO_PKG_VERSION"));
    info!("device: {}", display_serial(&config.device.serial));
    info!("forward port: {}", config.network.port);
    info!("output: {}", config.output.path.display());

    let device = Arc::new(AdbDevice::new(config.to_adb_config()));
    let writer = FrameWriter::new(
        config.output.path.clone(),
        Duration::from_millis(config.output.stats_interval_ms.max(1)),
    );
    let controller = ProjectionController::new(device, config.to_projection_config(), writer);

    if let Some(zoom) = cli.zoom {
        controller.set_zoom(zoom)?;
    }
    if let Some(degrees) = cli.rotate {
        controller.set_rotate(degrees)?;
    }
    if let Some(quality) = cli.quality {
        controller.set_quality(quality)?;
    }

    controller.start().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
            controller.close();
        }
        _ = controller.server().wait_closed() => {
            warn!("capture helper exited");
            controller.close();
        }
    }

    controller.join().await;
    controller.server().wait_closed().await;
    info!("minicap-mirror stopped");
    Ok(())
}

fn display_serial(serial: &str) -> &str {
    if serial.is_empty() { "<default>" } else { serial }
}
