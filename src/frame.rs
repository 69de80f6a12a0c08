//! Frame sampling and OCR preprocessing
//!
//! QR frames pass through untouched. OCR frames are cropped to a horizontal
//! band, downsampled, then binarized so the recognition engine only sees the
//! printed PIN strip in pure black and white.

use crate::scanner::ScanMode;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma};
use serde::{Deserialize, Serialize};

/// A still frame ready for detection
#[derive(Debug, Clone)]
pub struct Frame {
    image: DynamicImage,
    binarized: bool,
}

impl Frame {
    /// Wrap an image. Returns `None` for zero-sized images.
    pub fn new(image: DynamicImage) -> Option<Self> {
        if image.width() == 0 || image.height() == 0 {
            return None;
        }
        Some(Self {
            image,
            binarized: false,
        })
    }

    /// Frame width in pixels
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Frame height in pixels
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Underlying pixels
    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    /// Whether the pixels have been thresholded to pure black/white
    pub fn is_binarized(&self) -> bool {
        self.binarized
    }
}

/// Horizontal band of the frame handed to OCR
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionOfInterest {
    /// Vertical centre of the band as a fraction of frame height
    pub center: f32,
    /// Band height as a fraction of frame height
    pub height: f32,
    /// Downsampling factor applied after cropping
    pub scale: f32,
    /// Channel-average threshold; pixels strictly above become white
    pub threshold: u8,
}

impl Default for RegionOfInterest {
    fn default() -> Self {
        Self {
            center: 0.5,
            height: 0.10,
            scale: 0.5,
            threshold: 128,
        }
    }
}

impl RegionOfInterest {
    /// Clamp fields into usable ranges
    pub fn normalized(self) -> Self {
        Self {
            center: finite_or(self.center, 0.5).clamp(0.0, 1.0),
            height: finite_or(self.height, 0.10).clamp(0.01, 1.0),
            scale: finite_or(self.scale, 0.5).clamp(0.05, 1.0),
            threshold: self.threshold,
        }
    }

    /// Pixel rectangle `(y, height)` of the band within a frame of `frame_height`
    pub fn band(&self, frame_height: u32) -> (u32, u32) {
        if frame_height == 0 {
            return (0, 0);
        }
        let roi = self.normalized();
        let band_height = ((frame_height as f32 * roi.height).round() as u32).clamp(1, frame_height);
        let top = (frame_height as f32 * roi.center - band_height as f32 / 2.0).round();
        let max_top = frame_height - band_height;
        let top = (top.max(0.0) as u32).min(max_top);
        (top, band_height)
    }
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() { value } else { fallback }
}

/// Turns raw camera images into detector input
#[derive(Debug, Clone, Default)]
pub struct FrameSampler {
    roi: RegionOfInterest,
}

impl FrameSampler {
    /// Create a sampler for the given OCR region
    pub fn new(roi: RegionOfInterest) -> Self {
        Self {
            roi: roi.normalized(),
        }
    }

    /// Configured OCR region
    pub fn region(&self) -> &RegionOfInterest {
        &self.roi
    }

    /// Prepare a raw image for `mode`. Never fails; unusable input yields `None`.
    pub fn sample(&self, mode: ScanMode, raw: DynamicImage) -> Option<Frame> {
        let frame = Frame::new(raw)?;
        match mode {
            ScanMode::Qr => Some(frame),
            ScanMode::Ocr => self.extract_region(&frame),
        }
    }

    /// [`FrameSampler::sample`] with the OCR preprocessing moved to the
    /// blocking pool.
    pub async fn prepare(&self, mode: ScanMode, raw: DynamicImage) -> Option<Frame> {
        if mode == ScanMode::Qr {
            return Frame::new(raw);
        }
        let sampler = self.clone();
        tokio::task::spawn_blocking(move || sampler.sample(mode, raw))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(target: "voucherscan::frame", error = %e, "Frame preparation task failed");
                None
            })
    }

    /// Crop, downsample and binarize the OCR band.
    pub fn extract_region(&self, frame: &Frame) -> Option<Frame> {
        let (top, band_height) = self.roi.band(frame.height());
        let band = frame.image().crop_imm(0, top, frame.width(), band_height);

        let target_w = ((band.width() as f32 * self.roi.scale).round() as u32).max(1);
        let target_h = ((band.height() as f32 * self.roi.scale).round() as u32).max(1);
        let scaled = imageops::resize(&band.to_rgb8(), target_w, target_h, FilterType::Triangle);

        let binary = binarize(&DynamicImage::ImageRgb8(scaled), self.roi.threshold);
        Frame::new(DynamicImage::ImageLuma8(binary)).map(|mut f| {
            f.binarized = true;
            f
        })
    }
}

/// Threshold each pixel's RGB channel average: above `threshold` is white.
pub fn binarize(image: &DynamicImage, threshold: u8) -> GrayImage {
    let rgb = image.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let average = (r as u16 + g as u16 + b as u16) / 3;
        if average > threshold as u16 {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn zero_sized_frames_are_dropped() {
        let sampler = FrameSampler::default();
        assert!(sampler.sample(ScanMode::Qr, DynamicImage::new_rgb8(0, 10)).is_none());
        assert!(sampler.sample(ScanMode::Ocr, DynamicImage::new_rgb8(10, 0)).is_none());
    }

    #[test]
    fn qr_frames_pass_through() {
        let sampler = FrameSampler::default();
        let frame = sampler
            .sample(ScanMode::Qr, DynamicImage::new_rgb8(64, 48))
            .unwrap();
        assert_eq!((frame.width(), frame.height()), (64, 48));
        assert!(!frame.is_binarized());
    }

    #[test]
    fn default_band_is_centered_tenth() {
        let roi = RegionOfInterest::default();
        assert_eq!(roi.band(1000), (450, 100));
        assert_eq!(roi.band(5), (2, 1));
    }

    #[test]
    fn band_is_clamped_inside_frame() {
        let roi = RegionOfInterest {
            center: 1.0,
            height: 0.2,
            ..Default::default()
        };
        assert_eq!(roi.band(100), (80, 20));
    }

    #[test]
    fn ocr_frames_are_cropped_scaled_and_binarized() {
        let sampler = FrameSampler::default();
        let frame = sampler
            .sample(ScanMode::Ocr, DynamicImage::new_rgb8(200, 400))
            .unwrap();
        assert_eq!((frame.width(), frame.height()), (100, 20));
        assert!(frame.is_binarized());
        let luma = frame.image().to_luma8();
        assert!(luma.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
    }

    #[tokio::test]
    async fn prepare_matches_sample() {
        let sampler = FrameSampler::default();
        let frame = sampler
            .prepare(ScanMode::Ocr, DynamicImage::new_rgb8(200, 400))
            .await
            .unwrap();
        assert_eq!((frame.width(), frame.height()), (100, 20));
        assert!(frame.is_binarized());
        assert!(sampler.prepare(ScanMode::Qr, DynamicImage::new_rgb8(0, 4)).await.is_none());
    }

    #[test]
    fn binarize_uses_channel_average() {
        let mut img = RgbImage::new(3, 1);
        img.put_pixel(0, 0, Rgb([129, 129, 129]));
        img.put_pixel(1, 0, Rgb([128, 128, 128]));
        // Average of (255, 0, 150) is 135: white even though green is zero.
        img.put_pixel(2, 0, Rgb([255, 0, 150]));

        let out = binarize(&DynamicImage::ImageRgb8(img), 128);
        assert_eq!(out.get_pixel(0, 0).0, [255]);
        assert_eq!(out.get_pixel(1, 0).0, [0]);
        assert_eq!(out.get_pixel(2, 0).0, [255]);
    }
}
