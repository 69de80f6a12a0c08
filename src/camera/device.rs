//! V4L2 frame source for Linux webcams

use crate::camera::{CameraConfig, CameraHandle, Constraints, FrameSource, PixelFormat};
use crate::error::{Error, Result};
use async_trait::async_trait;
use image::{DynamicImage, ImageBuffer};
use serde::{Deserialize, Serialize};
use std::io;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

/// Highest /dev/videoN index probed during discovery
const MAX_DEVICE_INDEX: usize = 10;

const EPERM: i32 = 1;
const ENOENT: i32 = 2;
const EACCES: i32 = 13;
const EBUSY: i32 = 16;
const ENODEV: i32 = 19;

/// Information about a camera device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraDevice {
    /// Device index (e.g., 0 for /dev/video0)
    pub index: usize,
    /// Device path (e.g., "/dev/video0")
    pub path: String,
    /// Device name reported by the driver
    pub name: String,
    /// Driver name
    pub driver: String,
    /// Bus information
    pub bus_info: String,
}

/// List available V4L2 capture devices
pub fn list_devices() -> Result<Vec<CameraDevice>> {
    let mut devices = Vec::new();
    let mut denied = None;

    for i in 0..MAX_DEVICE_INDEX {
        let path = format!("/dev/video{}", i);

        match v4l::Device::new(i) {
            Ok(dev) => {
                if let Ok(caps) = dev.query_caps() {
                    if caps
                        .capabilities
                        .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    {
                        devices.push(CameraDevice {
                            index: i,
                            path,
                            name: caps.card,
                            driver: caps.driver,
                            bus_info: caps.bus,
                        });
                    }
                }
            }
            Err(err) if is_permission_error(&err) => denied = Some(path),
            Err(_) => continue,
        }
    }

    if devices.is_empty() {
        if let Some(path) = denied {
            return Err(Error::PermissionDenied(format!(
                "Access to {path} was refused (is the user in the 'video' group?)"
            )));
        }
        return Err(Error::DeviceNotFound(
            "No V4L2 capture devices found".to_string(),
        ));
    }

    Ok(devices)
}

/// Find a camera device by name (case-insensitive substring match)
pub fn find_device_by_name(name: &str) -> Result<CameraDevice> {
    let devices = list_devices()?;
    let name_lower = name.to_lowercase();

    devices
        .into_iter()
        .find(|d| d.name.to_lowercase().contains(&name_lower))
        .ok_or_else(|| Error::DeviceNotFound(format!("No device matching '{}'", name)))
}

fn is_permission_error(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::PermissionDenied
        || matches!(err.raw_os_error(), Some(EPERM) | Some(EACCES))
}

/// Map an OS error from opening or configuring a device onto the scan taxonomy.
fn map_open_error(context: &str, err: io::Error) -> Error {
    if is_permission_error(&err) {
        return Error::PermissionDenied(format!("{context}: {err}"));
    }
    match err.raw_os_error() {
        Some(ENOENT) | Some(ENODEV) => Error::DeviceNotFound(format!("{context}: {err}")),
        Some(EBUSY) => Error::DeviceUnavailable(format!("{context}: device busy")),
        _ if err.kind() == io::ErrorKind::NotFound => {
            Error::DeviceNotFound(format!("{context}: {err}"))
        }
        _ => Error::DeviceUnavailable(format!("{context}: {err}")),
    }
}

/// Frame layout the driver agreed to, which may differ from the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Negotiated {
    width: u32,
    height: u32,
    format: PixelFormat,
}

/// Memory-mapped stream plus the device it borrows from
struct OpenStream {
    handle: CameraHandle,
    negotiated: Negotiated,
    stream: MmapStream<'static>,
    /// Owning handle to the V4L device. Declared after `stream` so it is dropped last.
    _device: Box<Device>,
}

/// [`FrameSource`] backed by a V4L2 capture device
pub struct V4lSource {
    config: CameraConfig,
    open: Mutex<Option<OpenStream>>,
    next_id: AtomicU64,
}

impl V4lSource {
    /// Create a source; the device is opened on [`FrameSource::acquire`].
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            open: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Camera configuration
    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    fn resolve_device(&self) -> Result<CameraDevice> {
        if let Some(ref name) = self.config.device_name {
            find_device_by_name(name)
        } else if let Some(index) = self.config.device_index {
            list_devices()?
                .into_iter()
                .find(|d| d.index == index)
                .ok_or_else(|| {
                    Error::DeviceNotFound(format!("Device /dev/video{} not found", index))
                })
        } else {
            list_devices()?
                .into_iter()
                .next()
                .ok_or_else(|| Error::DeviceNotFound("No cameras available".to_string()))
        }
    }

    fn open_stream(
        &self,
        device_info: &CameraDevice,
    ) -> Result<(MmapStream<'static>, Box<Device>, Negotiated)> {
        let dev = Device::new(device_info.index)
            .map_err(|e| map_open_error("Failed to open device", e))?;

        let mut requested = dev
            .format()
            .map_err(|e| map_open_error("Failed to get format", e))?;
        requested.width = self.config.width;
        requested.height = self.config.height;
        requested.fourcc = self.config.format.to_fourcc();
        let fmt = dev
            .set_format(&requested)
            .map_err(|e| map_open_error("Failed to set format", e))?;

        let format = PixelFormat::from_fourcc(fmt.fourcc).ok_or_else(|| {
            Error::DeviceUnavailable(format!(
                "Driver chose unsupported pixel format {}",
                String::from_utf8_lossy(&fmt.fourcc.repr)
            ))
        })?;
        if fmt.width != self.config.width || fmt.height != self.config.height {
            tracing::warn!(
                target: "voucherscan::camera",
                "Driver adjusted resolution from {}x{} to {}x{}",
                self.config.width,
                self.config.height,
                fmt.width,
                fmt.height
            );
        }
        let negotiated = Negotiated {
            width: fmt.width,
            height: fmt.height,
            format,
        };

        let mut params = dev
            .params()
            .map_err(|e| map_open_error("Failed to get params", e))?;
        params.interval = v4l::Fraction::new(1, self.config.fps.max(1));
        dev.set_params(&params)
            .map_err(|e| map_open_error("Failed to set params", e))?;

        tracing::info!(
            target: "voucherscan::camera",
            "Camera configured: {}x{} @ {} fps ({})",
            fmt.width,
            fmt.height,
            self.config.fps,
            String::from_utf8_lossy(&fmt.fourcc.repr)
        );

        // SAFETY: the boxed device outlives the mmap stream; both live in OpenStream
        // and the stream field is dropped first.
        let device = Box::new(dev);
        let static_device: &'static Device =
            unsafe { mem::transmute::<&Device, &'static Device>(device.as_ref()) };

        let stream = MmapStream::with_buffers(
            static_device,
            Type::VideoCapture,
            self.config.buffer_count.max(2),
        )
        .map_err(|e| map_open_error("Failed to create stream", e))?;

        Ok((stream, device, negotiated))
    }
}

fn decode_frame(buf: &[u8], negotiated: Negotiated) -> Result<DynamicImage> {
    match negotiated.format {
        PixelFormat::Mjpeg => image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
            .map_err(|e| Error::Image(format!("MJPEG decode failed: {}", e))),
        PixelFormat::Yuyv => yuyv_to_rgb(buf, negotiated.width, negotiated.height),
        PixelFormat::Rgb24 => {
            let len = negotiated.width as usize * negotiated.height as usize * 3;
            buf.get(..len)
                .and_then(|pixels| {
                    ImageBuffer::from_raw(negotiated.width, negotiated.height, pixels.to_vec())
                })
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| Error::Image("Short RGB24 buffer".to_string()))
        }
    }
}

#[async_trait]
impl FrameSource for V4lSource {
    async fn acquire(&self, constraints: &Constraints) -> Result<CameraHandle> {
        let mut open = self.open.lock().await;
        if let Some(existing) = open.as_ref() {
            return Err(Error::CameraBusy(existing.handle.id()));
        }

        if constraints.facing != self.config.facing {
            tracing::debug!(
                target: "voucherscan::camera",
                requested = ?constraints.facing,
                "V4L2 devices carry no facing metadata; using configured device"
            );
        }

        let device_info = self.resolve_device()?;
        tracing::info!(
            target: "voucherscan::camera",
            "Opening camera: {} at {}",
            device_info.name,
            device_info.path
        );

        let (stream, device, negotiated) = self.open_stream(&device_info)?;
        let handle = CameraHandle::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            device_info.name.clone(),
        );

        *open = Some(OpenStream {
            handle: handle.clone(),
            negotiated,
            stream,
            _device: device,
        });

        Ok(handle)
    }

    async fn pull_frame(&self, handle: &CameraHandle) -> Result<Option<DynamicImage>> {
        let mut open = self.open.lock().await;
        let Some(inner) = open.as_mut().filter(|o| &o.handle == handle) else {
            return Ok(None);
        };

        let (buf, _meta) = inner
            .stream
            .next()
            .map_err(|e| Error::FrameCapture(format!("Failed to capture: {}", e)))?;

        if buf.is_empty() {
            return Ok(None);
        }

        match decode_frame(buf, inner.negotiated) {
            Ok(img) => Ok(Some(img)),
            Err(err) => {
                // Corrupt MJPEG frames happen while the sensor warms up.
                tracing::debug!(target: "voucherscan::camera", error = %err, "Dropping undecodable frame");
                Ok(None)
            }
        }
    }

    async fn release(&self, handle: &CameraHandle) {
        let mut open = self.open.lock().await;
        if open.as_ref().is_some_and(|o| &o.handle == handle) {
            // Dropping OpenStream stops streaming and closes the fd.
            open.take();
        }
    }
}

/// Convert a packed YUYV 4:2:2 buffer to RGB
fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<DynamicImage> {
    let w = width as usize;
    let h = height as usize;
    let mut rgb = vec![0u8; w * h * 3];

    for (pair, out) in yuyv
        .chunks_exact(4)
        .zip(rgb.chunks_exact_mut(6))
        .take(w * h / 2)
    {
        let u = pair[1] as i32 - 128;
        let v = pair[3] as i32 - 128;
        for (i, luma) in [pair[0], pair[2]].into_iter().enumerate() {
            let y = luma as i32;
            out[i * 3] = (y + ((v * 1436) >> 10)).clamp(0, 255) as u8;
            out[i * 3 + 1] = (y - ((u * 352 + v * 731) >> 10)).clamp(0, 255) as u8;
            out[i * 3 + 2] = (y + ((u * 1814) >> 10)).clamp(0, 255) as u8;
        }
    }

    ImageBuffer::from_raw(width, height, rgb)
        .map(DynamicImage::ImageRgb8)
        .ok_or_else(|| Error::Image("Failed to create RGB image from YUYV".to_string()))
}
