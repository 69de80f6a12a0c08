//! Camera acquisition and lifecycle
//!
//! Hardware access goes through the [`FrameSource`] capability so the scan
//! engine can run against V4L2 devices, replayed stills, or test fakes.
//! [`CameraManager`] sits on top of a source and enforces that at most one
//! [`CameraHandle`] is live at a time.

mod config;
#[cfg(feature = "simulator")]
#[cfg_attr(docsrs, doc(cfg(feature = "simulator")))]
pub mod replay;
#[cfg(feature = "camera")]
#[cfg_attr(docsrs, doc(cfg(feature = "camera")))]
pub mod device;

pub use config::{CameraConfig, Facing, PixelFormat};
#[cfg(feature = "camera")]
pub use device::{CameraDevice, V4lSource, find_device_by_name, list_devices};

use crate::error::{Error, Result};
use async_trait::async_trait;
use image::DynamicImage;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};

/// Default wait between releasing and re-acquiring the camera
pub const DEFAULT_SWITCH_DELAY: Duration = Duration::from_millis(500);

/// Constraints passed to [`FrameSource::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Constraints {
    /// Preferred facing direction
    pub facing: Facing,
}

/// Opaque token for an acquired camera stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraHandle {
    id: u64,
    label: String,
}

impl CameraHandle {
    /// Create a handle. Sources must hand out a distinct id per acquisition.
    pub fn new(id: u64, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
        }
    }

    /// Source-assigned identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Human-readable device label
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Display for CameraHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.label, self.id)
    }
}

/// Capability for acquiring a camera and pulling still frames from it
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Open a camera stream.
    ///
    /// Fails with [`Error::PermissionDenied`], [`Error::DeviceNotFound`] or
    /// [`Error::DeviceUnavailable`].
    async fn acquire(&self, constraints: &Constraints) -> Result<CameraHandle>;

    /// Pull the most recent frame. `Ok(None)` when no frame is ready yet.
    async fn pull_frame(&self, handle: &CameraHandle) -> Result<Option<DynamicImage>>;

    /// Stop the stream. Must tolerate handles that were already released.
    async fn release(&self, handle: &CameraHandle);
}

#[derive(Default)]
struct Slot {
    handle: Option<CameraHandle>,
    released_at: Option<Instant>,
    // Ticket of the acquisition in flight; cleared by `release` to cancel it.
    pending: Option<u64>,
    next_ticket: u64,
}

/// Single-holder owner of the camera resource
///
/// The slot lock is never held across [`FrameSource::acquire`], so a release
/// issued while the source is still waiting (for example on a permission
/// prompt) returns at once. The late handle is released by the cancelled
/// acquisition when it arrives.
pub struct CameraManager {
    source: Arc<dyn FrameSource>,
    slot: Mutex<Slot>,
    switch_delay: Duration,
}

impl CameraManager {
    /// Wrap a frame source with the default switch delay
    pub fn new(source: Arc<dyn FrameSource>) -> Self {
        Self::with_switch_delay(source, DEFAULT_SWITCH_DELAY)
    }

    /// Wrap a frame source with a custom release-to-acquire delay
    pub fn with_switch_delay(source: Arc<dyn FrameSource>, switch_delay: Duration) -> Self {
        Self {
            source,
            slot: Mutex::new(Slot::default()),
            switch_delay,
        }
    }

    /// Acquire the camera.
    ///
    /// Waits out the switch delay if the camera was released recently, and
    /// fails with [`Error::CameraBusy`] if a handle is still outstanding.
    /// Fails with [`Error::DeviceUnavailable`] if [`CameraManager::release`]
    /// cancels the acquisition before the source answers.
    pub async fn acquire(&self, constraints: &Constraints) -> Result<CameraHandle> {
        let (ticket, ready_at) = {
            let mut slot = self.slot.lock().await;
            if let Some(handle) = &slot.handle {
                return Err(Error::CameraBusy(handle.id()));
            }
            if slot.pending.is_some() {
                return Err(Error::DeviceUnavailable(
                    "camera acquisition already in progress".to_string(),
                ));
            }
            slot.next_ticket += 1;
            slot.pending = Some(slot.next_ticket);
            (
                slot.next_ticket,
                slot.released_at.map(|at| at + self.switch_delay),
            )
        };

        if let Some(ready_at) = ready_at.filter(|at| *at > Instant::now()) {
            tracing::debug!(
                target: "voucherscan::camera",
                wait_ms = ready_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Waiting for camera teardown before re-acquiring"
            );
            time::sleep_until(ready_at).await;
        }

        let cancelled = self.slot.lock().await.pending != Some(ticket);
        let acquired = if cancelled {
            Err(Error::DeviceUnavailable(
                "camera released before acquisition started".to_string(),
            ))
        } else {
            self.source.acquire(constraints).await
        };

        let mut slot = self.slot.lock().await;
        if slot.pending != Some(ticket) {
            if let Ok(handle) = &acquired {
                tracing::debug!(target: "voucherscan::camera", %handle, "Acquisition cancelled, releasing late handle");
                self.source.release(handle).await;
                slot.released_at = Some(Instant::now());
            }
            return Err(Error::DeviceUnavailable(
                "camera released while acquisition was pending".to_string(),
            ));
        }
        slot.pending = None;

        let handle = acquired?;
        tracing::info!(target: "voucherscan::camera", %handle, "Camera acquired");
        slot.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Pull a frame if `handle` is still the live handle.
    pub async fn pull_frame(&self, handle: &CameraHandle) -> Result<Option<DynamicImage>> {
        let slot = self.slot.lock().await;
        match &slot.handle {
            Some(live) if live == handle => self.source.pull_frame(handle).await,
            _ => Ok(None),
        }
    }

    /// Release whatever handle is live and cancel a pending acquisition.
    /// Returns whether a handle was released.
    pub async fn release(&self) -> bool {
        let mut slot = self.slot.lock().await;
        if slot.pending.take().is_some() {
            tracing::debug!(target: "voucherscan::camera", "Cancelling pending acquisition");
        }
        self.release_locked(&mut slot).await
    }

    /// Release only if `handle` is the live handle.
    pub async fn release_handle(&self, handle: &CameraHandle) -> bool {
        let mut slot = self.slot.lock().await;
        if slot.handle.as_ref() != Some(handle) {
            return false;
        }
        self.release_locked(&mut slot).await
    }

    /// Whether a handle is currently outstanding
    pub async fn is_held(&self) -> bool {
        self.slot.lock().await.handle.is_some()
    }

    /// Whether an acquisition is waiting on the source
    pub async fn is_acquiring(&self) -> bool {
        self.slot.lock().await.pending.is_some()
    }

    async fn release_locked(&self, slot: &mut Slot) -> bool {
        match slot.handle.take() {
            Some(handle) => {
                self.source.release(&handle).await;
                slot.released_at = Some(Instant::now());
                tracing::info!(target: "voucherscan::camera", %handle, "Camera released");
                true
            }
            None => false,
        }
    }
}
