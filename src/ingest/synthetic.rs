//! Synthetic frame source (`stub://`).
//!
//! Generates a deterministic gradient so the service can run without a
//! camera attached. The pattern shifts slowly with the frame counter.

use anyhow::Result;

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

pub struct SyntheticSource {
    uri: String,
    width: u32,
    height: u32,
    frame_count: u64,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(uri: &str, width: u32, height: u32) -> Self {
        Self {
            uri: uri.to_string(),
            width,
            height,
            frame_count: 0,
            connected: false,
        }
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let width = self.width as usize;
        let pixel_count = width * self.height as usize * 3;
        let shift = (self.frame_count / 50) as usize;
        let mut pixels = vec![0u8; pixel_count];
        for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
            let x = i % width;
            let y = i / width;
            px[0] = ((x + shift) % 256) as u8;
            px[1] = ((y + shift) % 256) as u8;
            px[2] = (((x + y) / 2) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("{} (synthetic {}x{})", self.uri, self.width, self.height)
    }

    /// Synthetic sources are always "connected".
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("SyntheticSource: connected to {}", self.uri);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::from_rgb(pixels, self.width, self.height, self.frame_count)
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.uri.clone(),
        }
    }
}
