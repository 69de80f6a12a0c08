//! QR code decoder using rqrr

use crate::frame::Frame;
use image::GrayImage;

/// Stateless QR decoder; one frame, one attempt
#[derive(Debug, Clone, Default)]
pub struct QrDecoder {}

impl QrDecoder {
    /// Create a new QR decoder with default settings
    pub fn new() -> Self {
        Self {}
    }

    /// Decode the first readable QR code in a frame
    pub fn decode(&self, frame: &Frame) -> Option<String> {
        self.decode_gray(frame.image().to_luma8())
    }

    /// Decode the first readable QR code in a grayscale image
    pub fn decode_gray(&self, img: GrayImage) -> Option<String> {
        let mut prepared = rqrr::PreparedImage::prepare(img);
        let grids = prepared.detect_grids();

        if grids.is_empty() {
            return None;
        }

        for grid in grids {
            match grid.decode() {
                Ok((meta, content)) => {
                    tracing::debug!(
                        target: "voucherscan::detect",
                        "Decoded QR: version={:?}, ecc_level={:?}, length={}",
                        meta.version,
                        meta.ecc_level,
                        content.len()
                    );
                    return Some(content);
                }
                Err(e) => {
                    tracing::trace!(target: "voucherscan::detect", "Skipping unreadable grid: {:?}", e);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Luma};
    use qrcode::QrCode;

    fn render(data: &str) -> Frame {
        let code = QrCode::new(data.as_bytes()).unwrap();
        let image = code.render::<Luma<u8>>().min_dimensions(300, 300).build();
        Frame::new(DynamicImage::ImageLuma8(image)).unwrap()
    }

    #[test]
    fn decodes_rendered_voucher_payload() {
        let decoder = QrDecoder::new();
        let frame = render("MTN|500|1234567890123");
        assert_eq!(
            decoder.decode(&frame).as_deref(),
            Some("MTN|500|1234567890123")
        );
    }

    #[test]
    fn blank_frame_has_no_payload() {
        let decoder = QrDecoder::new();
        let frame = Frame::new(DynamicImage::new_luma8(120, 120)).unwrap();
        assert!(decoder.decode(&frame).is_none());
    }
}
