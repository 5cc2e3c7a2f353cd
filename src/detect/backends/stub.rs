use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Stub backend for testing and dry runs. Reports a fixed set of boxes on
/// every frame, clipped to the frame.
#[derive(Default)]
pub struct StubBackend {
    boxes: Vec<[u32; 4]>,
}

impl StubBackend {
    pub fn new(boxes: Vec<[u32; 4]>) -> Self {
        Self { boxes }
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        Ok(self
            .boxes
            .iter()
            .filter_map(|[x, y, w, h]| {
                Detection::clipped(
                    *x as f32,
                    *y as f32,
                    *w as f32,
                    *h as f32,
                    frame.width(),
                    frame.height(),
                )
            })
            .map(|det| det.with_label("person"))
            .collect())
    }
}
