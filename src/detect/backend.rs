use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detector backend trait.
///
/// A backend turns one frame into zero or more pixel-space bounding boxes.
/// Filtering by confidence and class happens afterwards in
/// `DetectionFilter`, so backends should report every candidate they have
/// a box for.
///
/// Backends are owned by the detector worker and are never called
/// concurrently.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame. The frame is borrowed for the call only.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once at startup.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
