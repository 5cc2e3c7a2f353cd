//! Frame ingestion sources.
//!
//! This module provides the camera side of the pipeline:
//! - Synthetic frames (`stub://`) for tests and dry runs
//! - Still images on disk (`file://` or a plain image path)
//! - HTTP JPEG snapshots from IP cameras (`http://`, `https://`)
//! - USB/V4L2 devices (feature: ingest-v4l2)
//!
//! Every source is opened once at startup by `open_source`; failing to
//! connect there is fatal. After that the source is owned by the camera
//! worker and asked for exactly one frame per request.

#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod snapshot;
pub mod still;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};

use crate::config::CameraSettings;
use crate::frame::Frame;

pub use snapshot::SnapshotSource;
pub use still::StillImageSource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// A camera that can be asked for one frame at a time.
pub trait FrameSource: Send {
    /// Human-readable source identifier (URI or device path).
    fn describe(&self) -> String;

    /// Open the underlying device or stream.
    fn connect(&mut self) -> Result<()>;

    /// Capture the next frame.
    ///
    /// Sources may return an empty frame when the device delivered nothing;
    /// the caller decides how to surface that.
    fn next_frame(&mut self) -> Result<Frame>;

    /// Check if the source is healthy.
    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats;
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Build and connect the source named by `settings.source`.
pub fn open_source(settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    let mut source = build_source(settings)?;
    source.connect()?;
    log::info!("camera source ready: {}", source.describe());
    Ok(source)
}

fn build_source(settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    let uri = settings.source.trim();
    if uri.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(
            uri,
            settings.width,
            settings.height,
        )));
    }
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(Box::new(SnapshotSource::new(uri, settings.read_timeout)?));
    }
    if let Some(path) = uri.strip_prefix("file://") {
        return Ok(Box::new(StillImageSource::new(path)));
    }
    if has_image_extension(uri) {
        return Ok(Box::new(StillImageSource::new(uri)));
    }
    let device = uri.strip_prefix("v4l2://").unwrap_or(uri);
    if device.starts_with("/dev/") {
        #[cfg(feature = "ingest-v4l2")]
        {
            return Ok(Box::new(V4l2Source::new(v4l2::V4l2Config {
                device: device.to_string(),
                target_fps: settings.target_fps,
                width: settings.width,
                height: settings.height,
            })));
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            return Err(anyhow!(
                "camera device {} requires the ingest-v4l2 feature",
                device
            ));
        }
    }
    Err(anyhow!(
        "unsupported camera source '{}'; expected stub://, file://, http(s):// or a /dev/video path",
        uri
    ))
}

fn has_image_extension(uri: &str) -> bool {
    std::path::Path::new(uri)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}
