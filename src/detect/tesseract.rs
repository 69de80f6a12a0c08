//! [`OcrEngine`] backed by the `tesseract` command-line tool

use crate::detect::ocr::{OcrEngine, Recognition, RecognizeOptions, Segmentation};
use crate::error::{Error, Result};
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// How to invoke the tesseract binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseractConfig {
    /// Path or name of the executable
    pub binary: PathBuf,
    /// Trained data language
    pub language: String,
    /// Optional `--tessdata-dir`
    pub tessdata_dir: Option<PathBuf>,
}

impl Default for TesseractConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tesseract"),
            language: "eng".to_string(),
            tessdata_dir: None,
        }
    }
}

/// Pipes PNG-encoded frames through `tesseract stdin stdout`
#[derive(Debug, Clone, Default)]
pub struct TesseractEngine {
    config: TesseractConfig,
}

impl TesseractEngine {
    /// Create an engine from configuration
    pub fn new(config: TesseractConfig) -> Self {
        Self { config }
    }

    /// Command-line arguments for a recognition request
    pub fn arguments(&self, options: &RecognizeOptions) -> Vec<String> {
        let psm = match options.segmentation {
            Segmentation::SingleLine => "7",
            Segmentation::Auto => "3",
        };

        let mut args = vec![
            "stdin".to_string(),
            "stdout".to_string(),
            "-l".to_string(),
            self.config.language.clone(),
            "--psm".to_string(),
            psm.to_string(),
        ];
        if let Some(dir) = &self.config.tessdata_dir {
            args.push("--tessdata-dir".to_string());
            args.push(dir.display().to_string());
        }
        if !options.char_whitelist.is_empty() {
            args.push("-c".to_string());
            args.push(format!("tessedit_char_whitelist={}", options.char_whitelist));
        }
        args
    }
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    async fn recognize(
        &self,
        image: &DynamicImage,
        options: &RecognizeOptions,
    ) -> Result<Recognition> {
        let image = image.clone();
        let png = tokio::task::spawn_blocking(move || encode_png(&image))
            .await
            .map_err(|e| Error::RecognitionFailure(format!("PNG encode task failed: {e}")))??;

        let mut child = Command::new(&self.config.binary)
            .args(self.arguments(options))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::RecognitionFailure(format!(
                    "Failed to spawn {}: {e}",
                    self.config.binary.display()
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&png)
                .await
                .map_err(|e| Error::RecognitionFailure(format!("Failed to write frame: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::RecognitionFailure(format!("tesseract did not finish: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::RecognitionFailure(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(Recognition::text(
            String::from_utf8_lossy(&output.stdout).into_owned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_digits_arguments() {
        let engine = TesseractEngine::default();
        let args = engine.arguments(&RecognizeOptions::digits());
        assert_eq!(
            args,
            vec![
                "stdin",
                "stdout",
                "-l",
                "eng",
                "--psm",
                "7",
                "-c",
                "tessedit_char_whitelist=0123456789"
            ]
        );
    }

    #[tokio::test]
    async fn missing_binary_is_a_recognition_failure() {
        let engine = TesseractEngine::new(TesseractConfig {
            binary: PathBuf::from("/nonexistent/tesseract-binary"),
            ..Default::default()
        });
        let result = engine
            .recognize(&DynamicImage::new_luma8(4, 4), &RecognizeOptions::digits())
            .await;
        assert!(matches!(result, Err(Error::RecognitionFailure(_))));
    }
}
