//! Error types for voucher scanning operations

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using the crate's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for voucher scanning operations
#[derive(Error, Debug)]
pub enum Error {
    /// Camera access was refused by the platform or the user
    #[error("Camera permission denied: {0}")]
    PermissionDenied(String),

    /// No camera matching the request exists
    #[error("Camera device not found: {0}")]
    DeviceNotFound(String),

    /// The camera exists but could not be opened or stopped delivering frames
    #[error("Camera unavailable: {0}")]
    DeviceUnavailable(String),

    /// A camera handle is already outstanding
    #[error("Camera already acquired (handle {0})")]
    CameraBusy(u64),

    /// Failed to capture frame from camera
    #[error("Frame capture failed: {0}")]
    FrameCapture(String),

    /// The recognition engine failed or timed out on a frame
    #[error("Recognition failed: {0}")]
    RecognitionFailure(String),

    /// A decoded QR payload does not match any accepted voucher layout
    #[error("Malformed voucher payload: {0}")]
    MalformedPayload(String),

    /// A digit string failed voucher code validation
    #[error("Invalid voucher code: {0}")]
    InvalidCode(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image processing error
    #[error("Image processing error: {0}")]
    Image(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map the error onto the taxonomy reported to result sinks, if it has one.
    pub fn kind(&self) -> Option<ScanErrorKind> {
        match self {
            Error::PermissionDenied(_) => Some(ScanErrorKind::PermissionDenied),
            Error::DeviceNotFound(_) => Some(ScanErrorKind::DeviceNotFound),
            Error::DeviceUnavailable(_) | Error::FrameCapture(_) => {
                Some(ScanErrorKind::DeviceUnavailable)
            }
            Error::RecognitionFailure(_) => Some(ScanErrorKind::RecognitionFailure),
            Error::MalformedPayload(_) => Some(ScanErrorKind::MalformedPayload),
            _ => None,
        }
    }

    /// Whether the error ends the scan session rather than being retried.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::RecognitionFailure(_) | Error::InvalidCode(_) | Error::Image(_)
        )
    }
}

/// Error categories surfaced to result sinks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanErrorKind {
    /// The user or platform refused camera access
    PermissionDenied,
    /// No camera was found
    DeviceNotFound,
    /// The camera could not be used
    DeviceUnavailable,
    /// Transient recognition failure (never reported through `on_error`)
    RecognitionFailure,
    /// A scanned payload failed schema expectations
    MalformedPayload,
}

impl ScanErrorKind {
    /// Stable identifier for logs and structured output
    pub fn as_str(self) -> &'static str {
        match self {
            ScanErrorKind::PermissionDenied => "permission_denied",
            ScanErrorKind::DeviceNotFound => "device_not_found",
            ScanErrorKind::DeviceUnavailable => "device_unavailable",
            ScanErrorKind::RecognitionFailure => "recognition_failure",
            ScanErrorKind::MalformedPayload => "malformed_payload",
        }
    }

    /// User-facing status message for the error
    pub fn message(self) -> &'static str {
        match self {
            ScanErrorKind::PermissionDenied => {
                "Camera permission denied. Please allow camera access to scan codes."
            }
            ScanErrorKind::DeviceNotFound => "No camera found on this device.",
            ScanErrorKind::DeviceUnavailable => {
                "The camera is unavailable. Close other apps using it and try again."
            }
            ScanErrorKind::RecognitionFailure => "Could not read the code. Try again.",
            ScanErrorKind::MalformedPayload => {
                "Invalid voucher format. Expected NETWORK|PRICE|PIN or a PIN."
            }
        }
    }
}

impl fmt::Display for ScanErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Image(e.to_string())
    }
}

// V4L errors are converted manually in the camera module

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Other(format!("JSON error: {}", e))
    }
}
