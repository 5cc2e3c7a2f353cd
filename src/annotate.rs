//! Bounding box rendering.

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detect::Detection;

/// Outline color and stroke width for detection boxes.
#[derive(Clone, Debug, PartialEq)]
pub struct AnnotationStyle {
    pub color: [u8; 3],
    /// Stroke width in pixels, drawn inward from the box edge.
    pub thickness: u32,
}

impl Default for AnnotationStyle {
    fn default() -> Self {
        Self {
            color: [0, 255, 0],
            thickness: 2,
        }
    }
}

/// Draw one outline per detection onto `image`. Returns the number drawn,
/// which is always `detections.len()`.
pub fn draw_detections(
    image: &mut RgbImage,
    detections: &[Detection],
    style: &AnnotationStyle,
) -> usize {
    let color = Rgb(style.color);
    for det in detections {
        for inset in 0..style.thickness.max(1) {
            let width = det.width.saturating_sub(inset * 2);
            let height = det.height.saturating_sub(inset * 2);
            if width == 0 || height == 0 {
                break;
            }
            let rect =
                Rect::at((det.x + inset) as i32, (det.y + inset) as i32).of_size(width, height);
            draw_hollow_rect_mut(image, rect, color);
        }
    }
    detections.len()
}
