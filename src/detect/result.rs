/// One detected subject, in pixel coordinates of the frame it came from.
///
/// Boxes are always clipped to the frame and never zero-sized, so every
/// detection can be drawn.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub confidence: Option<f32>,
    pub label: Option<String>,
}

impl Detection {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width: width.max(1),
            height: height.max(1),
            confidence: None,
            label: None,
        }
    }

    /// Clip a floating-point box to a `frame_width` x `frame_height` frame.
    /// Returns `None` when nothing of the box lies inside the frame.
    pub fn clipped(
        left: f32,
        top: f32,
        width: f32,
        height: f32,
        frame_width: u32,
        frame_height: u32,
    ) -> Option<Self> {
        if !(left.is_finite() && top.is_finite() && width.is_finite() && height.is_finite()) {
            return None;
        }
        let x0 = left.max(0.0).round();
        let y0 = top.max(0.0).round();
        let x1 = (left + width).min(frame_width as f32).round();
        let y1 = (top + height).min(frame_height as f32).round();
        if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
            return None;
        }
        Some(Self::new(
            x0 as u32,
            y0 as u32,
            (x1 - x0) as u32,
            (y1 - y0) as u32,
        ))
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &Detection) -> f32 {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.width).min(other.x + other.width);
        let y1 = (self.y + self.height).min(other.y + other.height);
        if x1 <= x0 || y1 <= y0 {
            return 0.0;
        }
        let inter = (x1 - x0) as u64 * (y1 - y0) as u64;
        let union = self.area() + other.area() - inter;
        inter as f32 / union as f32
    }
}
