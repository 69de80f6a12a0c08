//! voucherscan command-line scanner

#[cfg(not(any(feature = "camera", feature = "simulator")))]
compile_error!("voucherscan needs the `camera` or `simulator` feature");

use clap::Parser;
#[cfg(target_family = "unix")]
use voucherscan::output::unix::EventSocket;
use voucherscan::output::{event_value, render_detection};
use voucherscan::{
    ChannelSink, Error, FrameSource, MetricsFormat, Result, ScanController, ScanEvent, ScanMode,
    TesseractEngine, VoucherConfig, logging, metrics,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[cfg(feature = "camera")]
use voucherscan::{V4lSource, camera};
#[cfg(feature = "simulator")]
use voucherscan::ReplaySource;

#[derive(Parser, Debug)]
#[command(
    name = "voucherscan",
    version,
    about = "Scan recharge voucher PINs from a camera via QR or OCR"
)]
struct Cli {
    /// Configuration file (toml/yaml). Defaults to voucherscan.{toml,yaml} in cwd or XDG config.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Camera name substring
    #[arg(long, value_name = "NAME")]
    device: Option<String>,

    /// Camera index (/dev/videoN)
    #[arg(long, value_name = "INDEX")]
    device_index: Option<usize>,

    /// Detection mode: `qr` or `ocr`
    #[arg(long, value_name = "MODE")]
    mode: Option<ScanMode>,

    /// Keep scanning after a detection; repeats of the same code are suppressed
    #[arg(long)]
    watch: bool,

    /// Print results as JSON lines
    #[arg(long)]
    json: bool,

    /// List detected cameras and exit
    #[cfg(feature = "camera")]
    #[arg(long)]
    list_cameras: bool,

    /// Path to the tesseract executable
    #[arg(long, value_name = "PATH")]
    tesseract: Option<PathBuf>,

    /// Log periodic metrics summaries
    #[arg(long)]
    metrics: bool,

    /// Serve metrics over HTTP (e.g. 127.0.0.1:9900)
    #[arg(long, value_name = "ADDR")]
    metrics_bind: Option<String>,

    /// Metrics endpoint format (`json` or `prometheus`)
    #[arg(long, value_name = "FORMAT")]
    metrics_format: Option<MetricsFormat>,

    /// Stream scan events as JSON lines over this Unix socket
    #[arg(long, value_name = "PATH")]
    unix_socket: Option<PathBuf>,

    /// Replay still images (files or directories) instead of opening a camera
    #[cfg(feature = "simulator")]
    #[arg(long, value_name = "PATH", num_args = 1..)]
    replay: Vec<PathBuf>,
}

struct Outputs {
    json: bool,
    #[cfg(target_family = "unix")]
    socket: Option<EventSocket>,
}

impl Outputs {
    fn emit(&self, event: &ScanEvent) -> Result<()> {
        #[cfg(target_family = "unix")]
        if let Some(socket) = &self.socket {
            socket.publish(event)?;
        }

        match event {
            ScanEvent::Detected { detection } => {
                let rendered = render_detection(detection);
                if self.json {
                    println!("{}", serde_json::to_string(&rendered.json)?);
                } else {
                    for line in &rendered.human {
                        println!("{line}");
                    }
                }
            }
            ScanEvent::Status { message, .. } => {
                if !self.json {
                    eprintln!("{message}");
                }
            }
            ScanEvent::Error { kind } => {
                if self.json {
                    println!("{}", serde_json::to_string(&event_value(event))?);
                } else {
                    eprintln!("Error: {}", kind.message());
                }
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    #[cfg(feature = "camera")]
    if cli.list_cameras {
        return list_cameras();
    }

    let mut config = VoucherConfig::load(cli.config.as_deref())?;
    apply_cli_overrides(&cli, &mut config);

    logging::init(&config.logging)?;

    if config.logging.metrics || config.logging.metrics_endpoint.is_some() {
        metrics::enable(config.logging.metrics_interval_secs);
        if let Some(endpoint) = &config.logging.metrics_endpoint {
            let addr: SocketAddr = endpoint.parse().map_err(|e| {
                Error::Config(format!("Invalid metrics endpoint '{endpoint}': {e}"))
            })?;
            metrics::spawn_http_endpoint(addr, config.logging.metrics_format)?;
        }
    }

    let outputs = Outputs {
        json: config.output.json,
        #[cfg(target_family = "unix")]
        socket: match &config.output.unix_socket {
            Some(path) => Some(EventSocket::bind(path).await?),
            None => None,
        },
    };

    let mode = config.scan.mode;
    let options = config.scan_options()?;
    let (sink, mut events) = ChannelSink::new();
    let controller = ScanController::new(
        frame_source(&cli, &config)?,
        Arc::new(TesseractEngine::new(config.ocr.clone())),
        Arc::new(sink),
        options,
    );

    info!(%mode, watch = cli.watch, "Starting voucher scanner");
    if let Err(err) = controller.start(mode).await {
        while let Ok(event) = events.try_recv() {
            outputs.emit(&event)?;
        }
        return Err(err);
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break Ok(()) };
                outputs.emit(&event)?;
                match event {
                    ScanEvent::Detected { .. } if cli.watch => {
                        if let Err(err) = controller.start(mode).await {
                            break Err(err);
                        }
                    }
                    ScanEvent::Detected { .. } => break Ok(()),
                    ScanEvent::Error { kind } => {
                        break Err(Error::Other(format!("Scan failed: {}", kind.message())));
                    }
                    ScanEvent::Status { .. } => {}
                }
            }
            _ = &mut shutdown => {
                info!("Interrupted, stopping scanner");
                break Ok(());
            }
        }
    };

    controller.stop().await;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ScanEvent::Error { .. }) {
            outputs.emit(&event)?;
        }
    }
    outcome
}

fn apply_cli_overrides(cli: &Cli, config: &mut VoucherConfig) {
    if let Some(name) = &cli.device {
        config.camera.device_name = Some(name.clone());
        config.camera.device_index = None;
    }
    if let Some(index) = cli.device_index {
        config.camera.device_index = Some(index);
        config.camera.device_name = None;
    }
    if let Some(mode) = cli.mode {
        config.scan.mode = mode;
    }
    if let Some(binary) = &cli.tesseract {
        config.ocr.binary = binary.clone();
    }
    if cli.json {
        config.output.json = true;
    }
    if cli.metrics {
        config.logging.metrics = true;
    }
    if let Some(bind) = &cli.metrics_bind {
        config.logging.metrics_endpoint = Some(bind.clone());
        config.logging.metrics = true;
    }
    if let Some(format) = cli.metrics_format {
        config.logging.metrics_format = format;
    }
    if let Some(path) = &cli.unix_socket {
        config.output.unix_socket = Some(path.clone());
    }
}

fn frame_source(cli: &Cli, config: &VoucherConfig) -> Result<Arc<dyn FrameSource>> {
    #[cfg(feature = "simulator")]
    if !cli.replay.is_empty() {
        info!(inputs = cli.replay.len(), "Replaying still images");
        return Ok(Arc::new(ReplaySource::from_paths(&cli.replay)?));
    }
    #[cfg(not(feature = "simulator"))]
    let _ = cli;

    #[cfg(feature = "camera")]
    return Ok(Arc::new(V4lSource::new(config.camera_config()?)));

    #[cfg(not(feature = "camera"))]
    {
        let _ = config;
        Err(Error::Config(
            "No frame source: pass --replay or build with the `camera` feature".to_string(),
        ))
    }
}

#[cfg(feature = "camera")]
fn list_cameras() -> Result<()> {
    let devices = camera::list_devices()?;
    println!("Discovered cameras:");
    for dev in devices {
        println!("  [{}] {} ({}, {})", dev.index, dev.name, dev.path, dev.driver);
    }
    Ok(())
}
