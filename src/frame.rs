//! Captured frame container.
//!
//! A `Frame` is one decoded RGB8 bitmap produced by a `FrameSource`. It lives
//! for the duration of a single request: detectors borrow it, the annotator
//! consumes it, and nothing keeps it afterwards.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::time::Instant;

pub struct Frame {
    image: RgbImage,
    /// Per-source capture counter (starts at 1).
    pub sequence: u64,
    captured_at: Instant,
}

impl Frame {
    /// Build a frame from tightly packed RGB bytes.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("RGB buffer does not match {}x{}", width, height))?;
        Ok(Self::from_image(image, sequence))
    }

    pub fn from_image(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// A frame with no pixels. Sources return this when the device delivered
    /// nothing; the pipeline treats it as a capture failure.
    pub fn empty(sequence: u64) -> Self {
        Self::from_image(RgbImage::new(0, 0), sequence)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    pub fn age_ms(&self) -> u128 {
        self.captured_at.elapsed().as_millis()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("sequence", &self.sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rgb_validates_length() {
        assert!(Frame::from_rgb(vec![0u8; 11], 2, 2, 1).is_err());
        let frame = Frame::from_rgb(vec![7u8; 12], 2, 2, 1).unwrap();
        assert_eq!(frame.width(), 2);
        assert_eq!(frame.height(), 2);
        assert!(!frame.is_empty());
        assert_eq!(frame.image().get_pixel(1, 1).0, [7, 7, 7]);
    }

    #[test]
    fn empty_frame_reports_empty() {
        let frame = Frame::empty(3);
        assert!(frame.is_empty());
        assert_eq!(frame.sequence, 3);
    }
}
