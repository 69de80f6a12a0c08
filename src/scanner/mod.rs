//! Scan loop orchestration
//!
//! [`ScanController`] ties the camera, frame sampler, detectors and validator
//! together. One polling task per session samples frames on a fixed cadence,
//! at most one detection is in flight at a time, and every asynchronous result
//! is checked against the generation it was started under before it may touch
//! session state or reach the [`ResultSink`].

mod controller;
mod session;
mod sink;

pub use controller::ScanController;
pub use session::{CodeOutcome, ScanSession, SessionSnapshot, TickDecision};
pub use sink::{ChannelSink, ResultSink, ScanEvent};

use crate::camera::{Constraints, DEFAULT_SWITCH_DELAY};
use crate::error::ScanErrorKind;
use crate::frame::RegionOfInterest;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Status shown while the camera is being acquired
pub const STATUS_INITIALIZING: &str = "Initializing camera…";
/// Status shown while polling
pub const STATUS_SCANNING: &str = "Scanning for code…";
/// Status shown once a code is accepted
pub const STATUS_DETECTED: &str = "Code detected!";
/// Soft hint after repeated empty attempts
pub const STATUS_HINT: &str = "No code found yet. Try adjusting the position or lighting.";
/// Status shown while tearing the session down
pub const STATUS_RELEASING: &str = "Stopping camera…";
/// Status shown once the camera is released
pub const STATUS_IDLE: &str = "Camera stopped";

/// Detection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Decode QR payloads
    #[default]
    Qr,
    /// Read printed digits
    Ocr,
}

impl ScanMode {
    /// Stable identifier
    pub fn as_str(self) -> &'static str {
        match self {
            ScanMode::Qr => "qr",
            ScanMode::Ocr => "ocr",
        }
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "qr" => Ok(ScanMode::Qr),
            "ocr" | "card" => Ok(ScanMode::Ocr),
            other => Err(format!("Unsupported scan mode '{other}', expected 'qr' or 'ocr'")),
        }
    }
}

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ScanState {
    /// No session
    #[default]
    Idle,
    /// Waiting for the camera
    RequestingPermission,
    /// Polling in the given mode
    Active(ScanMode),
    /// A detection call is in flight
    Processing(ScanMode),
    /// A code was emitted; terminal for the session
    Detected,
    /// The session failed; terminal for the session
    Error(ScanErrorKind),
    /// Tearing down
    Releasing,
}

impl ScanState {
    /// Whether a session is running or starting
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ScanState::RequestingPermission | ScanState::Active(_) | ScanState::Processing(_)
        )
    }

    /// Whether controls should be enabled (a usable camera handle exists)
    pub fn has_camera(self) -> bool {
        matches!(self, ScanState::Active(_) | ScanState::Processing(_))
    }

    /// Short label for logs and output
    pub fn label(self) -> &'static str {
        match self {
            ScanState::Idle => "idle",
            ScanState::RequestingPermission => "requesting_permission",
            ScanState::Active(_) => "active",
            ScanState::Processing(_) => "processing",
            ScanState::Detected => "detected",
            ScanState::Error(_) => "error",
            ScanState::Releasing => "releasing",
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Active(mode) | ScanState::Processing(mode) => {
                write!(f, "{}({})", self.label(), mode)
            }
            ScanState::Error(kind) => write!(f, "error({kind})"),
            _ => f.write_str(self.label()),
        }
    }
}

/// Runtime tuning for the scan loop
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Polling interval in QR mode
    pub qr_interval: Duration,
    /// Polling interval in OCR mode
    pub ocr_interval: Duration,
    /// Consecutive empty attempts tolerated before hinting; 0 disables hints
    pub hint_threshold: u32,
    /// Wait between releasing and re-acquiring the camera
    pub switch_delay: Duration,
    /// Upper bound on a single detection call; `None` waits indefinitely
    pub recognition_timeout: Option<Duration>,
    /// OCR crop and binarization settings
    pub region: RegionOfInterest,
    /// Constraints passed when acquiring the camera
    pub constraints: Constraints,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            qr_interval: Duration::from_millis(500),
            ocr_interval: Duration::from_millis(1000),
            hint_threshold: 5,
            switch_delay: DEFAULT_SWITCH_DELAY,
            recognition_timeout: Some(Duration::from_secs(10)),
            region: RegionOfInterest::default(),
            constraints: Constraints::default(),
        }
    }
}

impl ScanOptions {
    /// Polling interval for `mode`
    pub fn interval(&self, mode: ScanMode) -> Duration {
        let interval = match mode {
            ScanMode::Qr => self.qr_interval,
            ScanMode::Ocr => self.ocr_interval,
        };
        interval.max(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!("QR".parse::<ScanMode>(), Ok(ScanMode::Qr));
        assert_eq!("card".parse::<ScanMode>(), Ok(ScanMode::Ocr));
        assert!("barcode".parse::<ScanMode>().is_err());
    }

    #[test]
    fn default_cadence() {
        let options = ScanOptions::default();
        assert_eq!(options.interval(ScanMode::Qr), Duration::from_millis(500));
        assert_eq!(options.interval(ScanMode::Ocr), Duration::from_millis(1000));
    }

    #[test]
    fn state_labels() {
        assert_eq!(ScanState::Active(ScanMode::Ocr).to_string(), "active(ocr)");
        assert_eq!(
            ScanState::Error(ScanErrorKind::PermissionDenied).to_string(),
            "error(permission_denied)"
        );
        assert!(ScanState::RequestingPermission.is_live());
        assert!(!ScanState::Detected.is_live());
        assert!(!ScanState::RequestingPermission.has_camera());
    }
}
