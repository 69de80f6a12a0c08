//! Camera configuration

use serde::{Deserialize, Serialize};

/// Which way the requested camera should face
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    /// Rear camera, pointed at the voucher
    #[default]
    Environment,
    /// Front camera
    User,
}

impl Facing {
    /// Parse from a user-provided string (case-insensitive)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "environment" | "rear" | "back" => Some(Facing::Environment),
            "user" | "front" => Some(Facing::User),
            _ => None,
        }
    }
}

/// Camera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Camera device index (e.g., 0 for /dev/video0)
    /// If None, will auto-detect the first available camera
    pub device_index: Option<usize>,

    /// Camera device name to search for
    /// If set, this takes priority over device_index
    pub device_name: Option<String>,

    /// Preferred facing direction passed as an acquire constraint
    pub facing: Facing,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Frames per second
    pub fps: u32,

    /// Pixel format (MJPEG recommended for performance)
    pub format: PixelFormat,

    /// Number of V4L2 buffers to keep mapped
    pub buffer_count: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: None,
            device_name: None,
            facing: Facing::Environment,
            width: 1280, // printed PINs stay legible after the 0.5 OCR downscale
            height: 720,
            fps: 15,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
        }
    }
}

impl CameraConfig {
    /// Preset for lower-end webcams (lower resolution/fps for compatibility)
    pub fn compatible() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 15,
            format: PixelFormat::Yuyv,
            buffer_count: 4,
            ..Default::default()
        }
    }

    /// Preset for card scanning at full HD, useful for small printed PINs
    pub fn full_hd() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 10,
            format: PixelFormat::Mjpeg,
            buffer_count: 5,
            ..Default::default()
        }
    }
}

/// Pixel format for camera capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Motion JPEG (compressed, recommended for high resolution)
    Mjpeg,
    /// YUYV 4:2:2 (uncompressed, better compatibility)
    Yuyv,
    /// RGB24 (uncompressed, high bandwidth)
    Rgb24,
}

impl PixelFormat {
    /// Convert to V4L2 FourCC code
    #[cfg(feature = "camera")]
    pub fn to_fourcc(self) -> v4l::FourCC {
        match self {
            PixelFormat::Mjpeg => v4l::FourCC::new(b"MJPG"),
            PixelFormat::Yuyv => v4l::FourCC::new(b"YUYV"),
            PixelFormat::Rgb24 => v4l::FourCC::new(b"RGB3"),
        }
    }

    /// Map a V4L2 FourCC back to a supported format
    #[cfg(feature = "camera")]
    pub fn from_fourcc(fourcc: v4l::FourCC) -> Option<Self> {
        [PixelFormat::Mjpeg, PixelFormat::Yuyv, PixelFormat::Rgb24]
            .into_iter()
            .find(|format| format.to_fourcc() == fourcc)
    }

    /// Canonical string representation for configuration files
    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Mjpeg => "mjpeg",
            PixelFormat::Yuyv => "yuyv",
            PixelFormat::Rgb24 => "rgb24",
        }
    }

    /// Parse from a user-provided string (case-insensitive)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mjpeg" | "mjpg" => Some(PixelFormat::Mjpeg),
            "yuyv" => Some(PixelFormat::Yuyv),
            "rgb" | "rgb24" => Some(PixelFormat::Rgb24),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CameraConfig::default();
        assert_eq!(config.facing, Facing::Environment);
        assert_eq!(config.format, PixelFormat::Mjpeg);
        assert!(config.device_name.is_none());
    }

    #[test]
    fn test_compatible_preset() {
        let config = CameraConfig::compatible();
        assert_eq!((config.width, config.height), (640, 480));
        assert_eq!(config.format, PixelFormat::Yuyv);
    }

    #[cfg(feature = "camera")]
    #[test]
    fn test_pixel_format_fourcc() {
        assert_eq!(PixelFormat::Mjpeg.to_fourcc(), v4l::FourCC::new(b"MJPG"));
        assert_eq!(PixelFormat::Yuyv.to_fourcc(), v4l::FourCC::new(b"YUYV"));
        assert_eq!(
            PixelFormat::from_fourcc(v4l::FourCC::new(b"RGB3")),
            Some(PixelFormat::Rgb24)
        );
        assert_eq!(PixelFormat::from_fourcc(v4l::FourCC::new(b"NV12")), None);
    }

    #[test]
    fn test_parse_strings() {
        assert_eq!(PixelFormat::parse("MJPEG"), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::parse("rgb24"), Some(PixelFormat::Rgb24));
        assert!(PixelFormat::parse("invalid").is_none());
        assert_eq!(Facing::parse("Rear"), Some(Facing::Environment));
        assert_eq!(Facing::parse("front"), Some(Facing::User));
        assert!(Facing::parse("sideways").is_none());
    }
}
