mod audio;
mod button;
mod controller;
mod error;
mod gps;
mod gps_log;
mod indicator;
mod split;
mod state;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use controller::{CaptureController, CaptureSettings};
use gps::{FixSource, GpsOpener};
use indicator::{Indicator, NoIndicator, PixelRing};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory the WAV and CSV files are written to
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// BCM number of the pushbutton GPIO (21 = physical pin 40)
    #[arg(short, long, default_value_t = button::DEFAULT_PIN)]
    pin: u8,

    /// Presses closer than this to the last accepted one are ignored
    #[arg(long, default_value_t = 1000)]
    debounce_ms: u64,

    /// ALSA capture device of the mic array
    #[arg(short, long, default_value = audio::DEFAULT_DEVICE)]
    device: String,

    /// Recorder executable
    #[arg(long, default_value = audio::DEFAULT_RECORDER)]
    recorder: PathBuf,

    /// Serial port of the GPS module
    #[arg(long, default_value = gps::DEFAULT_PORT)]
    gps_port: String,

    #[arg(long, default_value_t = gps::DEFAULT_BAUD)]
    gps_baud: u32,

    /// Minimum time between GPS rows; 0 writes every read
    #[arg(long, default_value_t = 1000)]
    gps_interval_ms: u64,

    /// Split each finished recording into one file per channel
    #[arg(long)]
    split_channels: bool,

    /// Do not drive the pixel ring
    #[arg(long)]
    no_led: bool,

    /// Pixel ring colour while recording, as hex RGB
    #[arg(long, default_value = "00ff00", value_parser = parse_color)]
    led_color: u32,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split an existing multi-channel recording into per-channel files
    Split { input: PathBuf },
}

fn parse_color(value: &str) -> std::result::Result<u32, String> {
    let hex = value.trim_start_matches("0x").trim_start_matches('#');
    u32::from_str_radix(hex, 16)
        .ok()
        .filter(|c| *c <= 0xFF_FFFF)
        .ok_or_else(|| format!("'{}' is not an RGB hex colour", value))
}

fn open_indicator(args: &Args) -> Box<dyn Indicator> {
    if args.no_led {
        return Box::new(NoIndicator);
    }
    match PixelRing::open(args.led_color) {
        Ok(ring) => Box::new(ring),
        Err(e) => {
            tracing::warn!("Pixel ring unavailable, continuing without it: {}", e);
            Box::new(NoIndicator)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mic_gps_recorder=info".parse()?),
        )
        .init();

    let args = Args::parse();

    if let Some(Command::Split { input }) = &args.command {
        let report = split::split_channels(input)
            .with_context(|| format!("Failed to split {:?}", input))?;
        controller::log_split_report(input, &report);
        return Ok(());
    }

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Failed to create output directory {:?}", args.output_dir))?;

    let settings = CaptureSettings {
        output_dir: args.output_dir.clone(),
        recorder: audio::RecorderConfig {
            program: args.recorder.clone(),
            device: args.device.clone(),
        },
        debounce: Duration::from_millis(args.debounce_ms),
        gps_write_interval: Duration::from_millis(args.gps_interval_ms),
        split_on_stop: args.split_channels,
    };

    let gps_port = args.gps_port.clone();
    let gps_baud = args.gps_baud;
    let open_gps: GpsOpener = Arc::new(move || -> std::result::Result<Box<dyn FixSource>, gps::GpsError> {
        let receiver = gps::open_serial(&gps_port, gps_baud)?;
        Ok(Box::new(receiver) as Box<dyn FixSource>)
    });

    let mut controller = CaptureController::new(settings, open_indicator(&args), open_gps);

    let (edge_tx, mut edges) = mpsc::unbounded_channel();
    let _button = button::watch(args.pin, edge_tx).context("Failed to watch pushbutton")?;
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tracing::info!("Waiting for push button presses...");

    loop {
        tokio::select! {
            edge = edges.recv() => {
                let Some(at) = edge else { break };
                if let Err(e) = controller.on_edge(at) {
                    if e.is_fatal() {
                        controller.shutdown().await;
                        return Err(e).context("Capture session could not start");
                    }
                    tracing::error!("{}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
            _ = terminate.recv() => {
                tracing::info!("Terminated, shutting down");
                break;
            }
        }
    }

    tracing::info!("Recording is {} at shutdown", controller.state());
    controller.shutdown().await;
    Ok(())
}
