//! Frame source that replays still images instead of a live camera

use crate::camera::{CameraHandle, Constraints, FrameSource};
use crate::error::{Error, Result};
use async_trait::async_trait;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

struct Cursor {
    handle: Option<CameraHandle>,
    position: usize,
}

/// Cycles through a fixed set of frames, one per pull
pub struct ReplaySource {
    frames: Vec<DynamicImage>,
    cursor: Mutex<Cursor>,
    next_id: AtomicU64,
}

impl ReplaySource {
    /// Build a source from already-decoded frames
    pub fn new(frames: Vec<DynamicImage>) -> Self {
        Self {
            frames,
            cursor: Mutex::new(Cursor {
                handle: None,
                position: 0,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Load frames from image files, or from every image inside a directory
    pub fn from_paths(paths: &[PathBuf]) -> Result<Self> {
        let mut files = Vec::new();
        for path in paths {
            if path.is_dir() {
                let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|p| is_image(p))
                    .collect();
                entries.sort();
                files.extend(entries);
            } else {
                files.push(path.clone());
            }
        }

        let frames = files
            .iter()
            .map(|path| {
                image::open(path)
                    .map_err(|e| Error::Image(format!("Failed to load {}: {e}", path.display())))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            target: "voucherscan::camera",
            frames = frames.len(),
            "Loaded replay frames"
        );
        Ok(Self::new(frames))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn is_image(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref(),
        Some("png" | "jpg" | "jpeg" | "bmp" | "webp")
    )
}

#[async_trait]
impl FrameSource for ReplaySource {
    async fn acquire(&self, _constraints: &Constraints) -> Result<CameraHandle> {
        if self.frames.is_empty() {
            return Err(Error::DeviceNotFound("Replay source has no frames".to_string()));
        }

        let mut cursor = self.lock();
        if let Some(handle) = &cursor.handle {
            return Err(Error::CameraBusy(handle.id()));
        }
        let handle = CameraHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed), "replay");
        cursor.handle = Some(handle.clone());
        Ok(handle)
    }

    async fn pull_frame(&self, handle: &CameraHandle) -> Result<Option<DynamicImage>> {
        let mut cursor = self.lock();
        if cursor.handle.as_ref() != Some(handle) {
            return Ok(None);
        }
        let frame = self.frames[cursor.position % self.frames.len()].clone();
        cursor.position = cursor.position.wrapping_add(1);
        Ok(Some(frame))
    }

    async fn release(&self, handle: &CameraHandle) {
        let mut cursor = self.lock();
        if cursor.handle.as_ref() == Some(handle) {
            cursor.handle = None;
        }
    }
}
