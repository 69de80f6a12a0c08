//! Code detection strategies
//!
//! A [`Detector`] is either a synchronous QR decoder or an asynchronous OCR
//! extractor. Both take a prepared [`Frame`] and produce at most one raw
//! candidate per call.

mod ocr;
mod qr;
mod tesseract;

pub use ocr::{
    DIGIT_WHITELIST, MIN_DIGIT_RUN, OcrEngine, OcrExtractor, Recognition, RecognizeOptions,
    Segmentation, apply_whitelist, extract_digit_run,
};
pub use qr::QrDecoder;
pub use tesseract::{TesseractConfig, TesseractEngine};

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::scanner::ScanMode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which detector produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionKind {
    /// Decoded from a QR code
    Qr,
    /// Read from printed digits
    Ocr,
}

/// Raw detector output, consumed once by the validator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionResult {
    /// Payload text (QR contents or the selected digit run)
    pub raw_payload: String,
    /// Producing detector
    pub kind: DetectionKind,
}

/// Detection strategy for one scan mode
#[derive(Clone)]
pub enum Detector {
    /// QR decoding
    Qr(QrDecoder),
    /// OCR digit extraction
    Ocr(OcrExtractor),
}

impl Detector {
    /// Scan mode served by this detector
    pub fn mode(&self) -> ScanMode {
        match self {
            Detector::Qr(_) => ScanMode::Qr,
            Detector::Ocr(_) => ScanMode::Ocr,
        }
    }

    /// Run one detection attempt on a frame.
    ///
    /// QR decoding runs on the blocking pool, so dropping the returned future
    /// (for example on a timeout) returns control at once. `Ok(None)` means
    /// nothing was found; errors are recognition failures.
    pub async fn detect(&self, frame: Arc<Frame>) -> Result<Option<DetectionResult>> {
        match self {
            Detector::Qr(decoder) => {
                let decoder = decoder.clone();
                let payload = tokio::task::spawn_blocking(move || decoder.decode(&frame))
                    .await
                    .map_err(|e| Error::RecognitionFailure(format!("QR decode task failed: {e}")))?;
                Ok(payload.map(|raw_payload| DetectionResult {
                    raw_payload,
                    kind: DetectionKind::Qr,
                }))
            }
            Detector::Ocr(extractor) => Ok(extractor.extract(&frame).await?.map(|raw_payload| {
                DetectionResult {
                    raw_payload,
                    kind: DetectionKind::Ocr,
                }
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn slow_qr_decode_is_bounded_by_timeout() {
        let frame = Arc::new(Frame::new(DynamicImage::new_rgb8(3840, 2160)).unwrap());
        let detector = Detector::Qr(QrDecoder::new());

        let started = Instant::now();
        let outcome = tokio::time::timeout(Duration::from_millis(1), detector.detect(frame)).await;

        assert!(outcome.is_err());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn qr_detector_reports_nothing_on_blank_frame() {
        let frame = Arc::new(Frame::new(DynamicImage::new_luma8(64, 64)).unwrap());
        let detector = Detector::Qr(QrDecoder::new());
        assert_eq!(detector.mode(), ScanMode::Qr);
        assert!(detector.detect(frame).await.unwrap().is_none());
    }
}
