//! Capture → detect → annotate → encode.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::annotate::{draw_detections, AnnotationStyle};
use crate::detect::{Detection, DetectionFilter, DetectorBackend};
use crate::encoding::{encode_jpeg, jpeg_data_uri};
use crate::error::HeadcountError;
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::worker::Worker;

/// Response body of a successful headcount.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeadcountPayload {
    pub headcount: u32,
    /// `data:image/jpg;base64,...` of the annotated frame.
    pub image: String,
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub filter: DetectionFilter,
    pub style: AnnotationStyle,
    pub jpeg_quality: u8,
    pub camera_timeout: Duration,
    pub detector_timeout: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct CameraStatus {
    pub source: String,
    pub healthy: bool,
    pub frames_captured: u64,
}

/// Camera health as of the last capture. Written by the camera worker after
/// every read so status checks never wait behind a capture.
struct CameraHealth {
    source: String,
    healthy: AtomicBool,
    frames_captured: AtomicU64,
}

impl CameraHealth {
    fn record(&self, source: &dyn FrameSource) {
        self.healthy.store(source.is_healthy(), Ordering::SeqCst);
        self.frames_captured
            .store(source.stats().frames_captured, Ordering::SeqCst);
    }
}

pub struct HeadcountPipeline {
    camera: Worker<Box<dyn FrameSource>>,
    camera_health: Arc<CameraHealth>,
    detector: Worker<Box<dyn DetectorBackend>>,
    detector_name: &'static str,
    settings: PipelineSettings,
}

impl HeadcountPipeline {
    /// Take ownership of an opened camera and a loaded detector.
    pub fn new(
        source: Box<dyn FrameSource>,
        detector: Box<dyn DetectorBackend>,
        settings: PipelineSettings,
    ) -> Result<Self, HeadcountError> {
        let detector_name = detector.name();
        let stats = source.stats();
        let camera_health = Arc::new(CameraHealth {
            source: stats.source,
            healthy: AtomicBool::new(source.is_healthy()),
            frames_captured: AtomicU64::new(stats.frames_captured),
        });
        let spawn_failed = |err: std::io::Error| HeadcountError::Startup(err.to_string());
        Ok(Self {
            camera: Worker::spawn("camera", source).map_err(spawn_failed)?,
            camera_health,
            detector: Worker::spawn("detector", detector).map_err(spawn_failed)?,
            detector_name,
            settings,
        })
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector_name
    }

    /// Read exactly one frame. An empty frame is a capture failure.
    pub fn capture_frame(&self) -> Result<Frame, HeadcountError> {
        let health = Arc::clone(&self.camera_health);
        let frame = self
            .camera
            .run(self.settings.camera_timeout, move |source| {
                let frame = source.next_frame();
                health.record(&**source);
                frame
            })?
            .map_err(HeadcountError::capture)?;
        if frame.is_empty() {
            return Err(HeadcountError::Capture(
                "camera returned an empty frame".to_string(),
            ));
        }
        Ok(frame)
    }

    /// Run the detector on `frame` and apply the configured filter. The frame
    /// is handed back alongside the surviving detections.
    pub fn detect(&self, frame: Frame) -> Result<(Frame, Vec<Detection>), HeadcountError> {
        let (frame, raw) = self
            .detector
            .run(self.settings.detector_timeout, move |detector| {
                let result = detector.detect(&frame);
                (frame, result)
            })?;
        let raw = raw.map_err(HeadcountError::detection)?;
        let found = raw.len();
        let kept = self.settings.filter.apply(raw);
        log::debug!(
            "frame {}: {} candidates, {} after filtering ({}ms since capture)",
            frame.sequence,
            found,
            kept.len(),
            frame.age_ms()
        );
        Ok((frame, kept))
    }

    /// Full capture-detect-respond cycle.
    pub fn run(&self) -> Result<HeadcountPayload, HeadcountError> {
        let frame = self.capture_frame()?;
        let (frame, detections) = self.detect(frame)?;
        let payload = annotate_and_encode(
            frame,
            &detections,
            &self.settings.style,
            self.settings.jpeg_quality,
        )?;
        log::info!("headcount {}", payload.headcount);
        Ok(payload)
    }

    /// Capture one frame and return it JPEG-encoded, without detection.
    pub fn capture_jpeg(&self) -> Result<Vec<u8>, HeadcountError> {
        let frame = self.capture_frame()?;
        encode_jpeg(frame.image(), self.settings.jpeg_quality).map_err(HeadcountError::encoding)
    }

    pub fn camera_status(&self) -> CameraStatus {
        CameraStatus {
            source: self.camera_health.source.clone(),
            healthy: self.camera_health.healthy.load(Ordering::SeqCst),
            frames_captured: self.camera_health.frames_captured.load(Ordering::SeqCst),
        }
    }
}

/// Draw `detections` onto the frame and encode the result. The headcount is
/// the number of rectangles drawn.
pub fn annotate_and_encode(
    frame: Frame,
    detections: &[Detection],
    style: &AnnotationStyle,
    jpeg_quality: u8,
) -> Result<HeadcountPayload, HeadcountError> {
    let mut image = frame.into_image();
    let drawn = draw_detections(&mut image, detections, style);
    let headcount = u32::try_from(drawn)
        .map_err(|_| HeadcountError::Detection(format!("{drawn} detections overflow headcount")))?;
    let image = jpeg_data_uri(&image, jpeg_quality).map_err(HeadcountError::encoding)?;
    Ok(HeadcountPayload { headcount, image })
}
