//! Still-image frame source.
//!
//! Re-reads a local image file on every capture. Useful for kiosks that
//! drop the latest camera still into a directory, and for replaying a known
//! scene against a detector.

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

pub struct StillImageSource {
    path: PathBuf,
    frame_count: u64,
    last_error: Option<String>,
}

impl StillImageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            frame_count: 0,
            last_error: None,
        }
    }

    fn read_frame(&self) -> Result<image::RgbImage> {
        let image = image::open(&self.path)
            .with_context(|| format!("decode still image {}", self.path.display()))?;
        Ok(image.into_rgb8())
    }
}

impl FrameSource for StillImageSource {
    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }

    fn connect(&mut self) -> Result<()> {
        if !self.path.is_file() {
            return Err(anyhow!(
                "still image {} is not a readable file",
                self.path.display()
            ));
        }
        log::info!("StillImageSource: using {}", self.path.display());
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let image = self.read_frame().map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;
        self.frame_count += 1;
        self.last_error = None;
        Ok(Frame::from_image(image, self.frame_count))
    }

    fn is_healthy(&self) -> bool {
        self.last_error.is_none()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.describe(),
        }
    }
}
