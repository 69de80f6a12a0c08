//! OCR digit extraction
//!
//! The recognition engine itself is injected through [`OcrEngine`]; this
//! module owns the request options and the digit-run selection applied to
//! whatever text comes back.

use crate::error::Result;
use crate::frame::Frame;
use async_trait::async_trait;
use image::DynamicImage;
use std::sync::Arc;

/// Characters the engine may emit for voucher PINs
pub const DIGIT_WHITELIST: &str = "0123456789";

/// Shortest digit run considered a PIN candidate
pub const MIN_DIGIT_RUN: usize = 8;

/// Page segmentation requested from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segmentation {
    /// Treat the image as a single line of text
    SingleLine,
    /// Let the engine detect the layout
    Auto,
}

/// Options passed with each recognition request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognizeOptions {
    /// Only these characters may appear in the output
    pub char_whitelist: String,
    /// Layout hint
    pub segmentation: Segmentation,
}

impl RecognizeOptions {
    /// Digits-only, single-line recognition
    pub fn digits() -> Self {
        Self {
            char_whitelist: DIGIT_WHITELIST.to_string(),
            segmentation: Segmentation::SingleLine,
        }
    }
}

impl Default for RecognizeOptions {
    fn default() -> Self {
        Self::digits()
    }
}

/// Text returned by an engine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recognition {
    /// Recognized text
    pub text: String,
    /// Mean confidence in `[0, 100]`, when the engine reports one
    pub confidence: Option<f32>,
}

impl Recognition {
    /// Recognition without a confidence score
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: None,
        }
    }
}

/// External text-recognition engine
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Recognize text in `image`. Failures are transient and retried by the scan loop.
    async fn recognize(&self, image: &DynamicImage, options: &RecognizeOptions)
    -> Result<Recognition>;
}

/// Runs an [`OcrEngine`] over frames and picks the PIN candidate
#[derive(Clone)]
pub struct OcrExtractor {
    engine: Arc<dyn OcrEngine>,
    options: RecognizeOptions,
    min_run: usize,
}

impl OcrExtractor {
    /// Extractor with digits-only options
    pub fn new(engine: Arc<dyn OcrEngine>) -> Self {
        Self {
            engine,
            options: RecognizeOptions::digits(),
            min_run: MIN_DIGIT_RUN,
        }
    }

    /// Override the minimum run length
    pub fn with_min_run(mut self, min_run: usize) -> Self {
        self.min_run = min_run.max(1);
        self
    }

    /// Recognize a frame and return the selected digit run, if any
    pub async fn extract(&self, frame: &Frame) -> Result<Option<String>> {
        let recognition = self.engine.recognize(frame.image(), &self.options).await?;
        tracing::debug!(
            target: "voucherscan::detect",
            text = %recognition.text.trim(),
            confidence = ?recognition.confidence,
            "OCR pass complete"
        );
        let filtered = apply_whitelist(&recognition.text, &self.options.char_whitelist);
        Ok(extract_digit_run(&filtered, self.min_run))
    }
}

/// Drop characters outside `whitelist`, keeping whitespace as run separators.
pub fn apply_whitelist(text: &str, whitelist: &str) -> String {
    text.chars()
        .filter(|c| c.is_whitespace() || whitelist.contains(*c))
        .collect()
}

/// Longest run of at least `min_len` consecutive ASCII digits; ties go to the first.
pub fn extract_digit_run(text: &str, min_len: usize) -> Option<String> {
    let mut best: Option<&str> = None;
    let mut start = None;

    for (i, b) in text.bytes().enumerate() {
        match (b.is_ascii_digit(), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                best = longer_run(best, &text[s..i], min_len);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        best = longer_run(best, &text[s..], min_len);
    }

    best.map(str::to_string)
}

fn longer_run<'a>(best: Option<&'a str>, run: &'a str, min_len: usize) -> Option<&'a str> {
    if run.len() >= min_len && best.is_none_or(|b| run.len() > b.len()) {
        Some(run)
    } else {
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_joins_digits_split_by_letters() {
        let filtered = apply_whitelist("A1B2C34567890C", DIGIT_WHITELIST);
        assert_eq!(filtered, "1234567890");
        assert_eq!(
            extract_digit_run(&filtered, MIN_DIGIT_RUN).as_deref(),
            Some("1234567890")
        );
    }

    #[test]
    fn longest_run_wins() {
        let text = "12345678 123456789012 99";
        assert_eq!(
            extract_digit_run(text, 8).as_deref(),
            Some("123456789012")
        );
    }

    #[test]
    fn ties_go_to_first_occurrence() {
        let text = "1111111111\n2222222222";
        assert_eq!(extract_digit_run(text, 8).as_deref(), Some("1111111111"));
    }

    #[test]
    fn short_runs_are_ignored() {
        assert_eq!(extract_digit_run("1234567 12 3", 8), None);
        assert_eq!(extract_digit_run("", 8), None);
        assert_eq!(extract_digit_run("12345678", 8).as_deref(), Some("12345678"));
    }

    struct FixedEngine(&'static str);

    #[async_trait]
    impl OcrEngine for FixedEngine {
        async fn recognize(
            &self,
            _image: &DynamicImage,
            options: &RecognizeOptions,
        ) -> Result<Recognition> {
            assert_eq!(options.char_whitelist, DIGIT_WHITELIST);
            assert_eq!(options.segmentation, Segmentation::SingleLine);
            Ok(Recognition::text(self.0))
        }
    }

    #[tokio::test]
    async fn extractor_filters_engine_output() {
        let extractor = OcrExtractor::new(Arc::new(FixedEngine("PIN: 4321 8765 4321 09\n")));
        let frame = Frame::new(DynamicImage::new_luma8(8, 8)).unwrap();
        // Whitespace-separated groups stay separate runs; none reach eight digits.
        assert_eq!(extractor.extract(&frame).await.unwrap(), None);

        let extractor = OcrExtractor::new(Arc::new(FixedEngine("PIN 9876543210555")));
        assert_eq!(
            extractor.extract(&frame).await.unwrap().as_deref(),
            Some("9876543210555")
        );
    }
}
