//! voucherscan - camera-based recharge voucher scanner
//!
//! Reads airtime voucher PINs from a live camera, either by decoding a QR
//! code or by OCR over a narrow band of the frame, validates them, and hands
//! the `*311*PIN#` dial string to a [`ResultSink`].
//!
//! # Features
//!
//! - **Scan loop**: one timer per session, at most one detection in flight,
//!   stale results discarded by generation token
//! - **Camera**: V4L2 capture (`camera` feature) or image replay (`simulator`)
//! - **Detection**: rqrr QR decoding and pluggable OCR engines
//! - **Async-first**: built on Tokio
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use voucherscan::{
//!     CameraConfig, ChannelSink, ScanController, ScanEvent, ScanMode, ScanOptions,
//!     TesseractEngine, V4lSource,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (sink, mut events) = ChannelSink::new();
//!     let controller = ScanController::new(
//!         Arc::new(V4lSource::new(CameraConfig::default())),
//!         Arc::new(TesseractEngine::default()),
//!         Arc::new(sink),
//!         ScanOptions::default(),
//!     );
//!
//!     controller.start(ScanMode::Qr).await?;
//!     while let Some(event) = events.recv().await {
//!         if let ScanEvent::Detected { detection } = event {
//!             println!("Dial {}", detection.formatted_code());
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs, rust_2024_compatibility)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod camera;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod logging;
pub mod metrics;
pub mod output;
pub mod scanner;
pub mod voucher;

pub use error::{Error, Result, ScanErrorKind};

pub use camera::{
    CameraConfig, CameraHandle, CameraManager, Constraints, Facing, FrameSource, PixelFormat,
};
#[cfg(feature = "camera")]
#[cfg_attr(docsrs, doc(cfg(feature = "camera")))]
pub use camera::{CameraDevice, V4lSource};
#[cfg(feature = "simulator")]
#[cfg_attr(docsrs, doc(cfg(feature = "simulator")))]
pub use camera::replay::ReplaySource;

pub use config::{
    CameraOptions, LogRotation, LoggingOptions, MetricsFormat, OutputOptions, ScanSettings,
    VoucherConfig,
};
pub use detect::{
    DetectionKind, DetectionResult, Detector, OcrEngine, OcrExtractor, QrDecoder, Recognition,
    RecognizeOptions, TesseractConfig, TesseractEngine,
};
pub use frame::{Frame, FrameSampler, RegionOfInterest};
pub use scanner::{
    ChannelSink, ResultSink, ScanController, ScanEvent, ScanMode, ScanOptions, ScanSession,
    ScanState, SessionSnapshot,
};
pub use voucher::{
    Detection, Network, VoucherCode, VoucherRecord, format_dial_code, is_dial_code,
    parse_qr_payload, validate,
};
