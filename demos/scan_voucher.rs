//! Scan voucher codes from a webcam
//!
//! Usage: cargo run --example scan_voucher [qr|ocr]

use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use voucherscan::{
    CameraConfig, ChannelSink, ScanController, ScanEvent, ScanMode, ScanOptions, TesseractEngine,
    V4lSource,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mode: ScanMode = match std::env::args().nth(1) {
        Some(arg) => arg.parse().map_err(anyhow::Error::msg)?,
        None => ScanMode::Qr,
    };

    println!("Available cameras:");
    match voucherscan::camera::list_devices() {
        Ok(devices) => {
            for dev in &devices {
                println!("  [{}] {} ({})", dev.index, dev.name, dev.path);
            }
        }
        Err(e) => {
            eprintln!("Error listing cameras: {e}");
            return Ok(());
        }
    }

    let (sink, mut events) = ChannelSink::new();
    let controller = ScanController::new(
        Arc::new(V4lSource::new(CameraConfig::default())),
        Arc::new(TesseractEngine::default()),
        Arc::new(sink),
        ScanOptions::default(),
    );

    println!("\nScanning in {mode} mode (Ctrl+C to stop)...\n");
    controller.start(mode).await?;

    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                ScanEvent::Detected { detection } => {
                    println!("Code detected: {}", detection.formatted_code());
                    // The same code stays suppressed until a different one is detected or reset() is called.
                    controller.start(mode).await?;
                }
                ScanEvent::Status { message, .. } => println!("  {message}"),
                ScanEvent::Error { kind } => {
                    eprintln!("Error: {}", kind.message());
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    controller.stop().await;
    Ok(())
}
