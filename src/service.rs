//! Request-level operations behind the HTTP routes.

use serde::{Deserialize, Serialize};

use crate::config::HeadcountConfig;
use crate::detect::build_detector;
use crate::error::HeadcountError;
use crate::ingest::open_source;
use crate::pipeline::{HeadcountPayload, HeadcountPipeline, PipelineSettings};
use crate::store::FrameStore;
use crate::transport::DetectionServiceClient;

/// Reply to `POST /capture`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptureReceipt {
    pub message: String,
    pub path: String,
}

/// Reply to `GET /health`.
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub camera: String,
    pub camera_healthy: bool,
    pub frames_captured: u64,
    pub detector: &'static str,
}

pub struct HeadcountService {
    pipeline: HeadcountPipeline,
    store: FrameStore,
    remote: Option<DetectionServiceClient>,
}

impl HeadcountService {
    pub fn new(
        pipeline: HeadcountPipeline,
        store: FrameStore,
        remote: Option<DetectionServiceClient>,
    ) -> Self {
        Self {
            pipeline,
            store,
            remote,
        }
    }

    /// Open the camera, load the detector and build the service client.
    /// Any failure here is a `Startup` error and should end the process.
    pub fn from_config(cfg: &HeadcountConfig) -> Result<Self, HeadcountError> {
        let startup = |err: anyhow::Error| HeadcountError::Startup(format!("{err:#}"));
        let source = open_source(&cfg.camera).map_err(startup)?;
        let detector = build_detector(&cfg.detector).map_err(startup)?;
        let remote =
            DetectionServiceClient::from_settings(&cfg.detection_service).map_err(startup)?;
        let pipeline = HeadcountPipeline::new(
            source,
            detector,
            PipelineSettings {
                filter: cfg.detector.filter(),
                style: cfg.annotation.clone(),
                jpeg_quality: cfg.jpeg_quality,
                camera_timeout: cfg.camera.read_timeout,
                detector_timeout: cfg.detector.timeout,
            },
        )?;
        Ok(Self::new(pipeline, FrameStore::new(&cfg.storage), remote))
    }

    /// `GET /capture`: local capture-detect-respond.
    pub fn headcount(&self) -> Result<HeadcountPayload, HeadcountError> {
        self.pipeline.run()
    }

    /// `POST /capture`: persist one frame for a later `/headcount`.
    pub fn capture_to_store(&self) -> Result<CaptureReceipt, HeadcountError> {
        let jpeg = self.pipeline.capture_jpeg()?;
        let path = self.store.save_capture(&jpeg)?;
        log::info!("captured frame saved to {}", path.display());
        Ok(CaptureReceipt {
            message: "Image captured successfully".to_string(),
            path: path.display().to_string(),
        })
    }

    /// `GET /headcount`: send the persisted frame to the detection service,
    /// keep its annotated image and relay its answer.
    pub fn relay_headcount(&self) -> Result<HeadcountPayload, HeadcountError> {
        let remote = self
            .remote
            .as_ref()
            .ok_or(HeadcountError::ServiceNotConfigured)?;
        let jpeg = self.store.load_capture()?;
        let reply = remote.detect(jpeg)?;
        let path = self.store.save_detected(&reply.image)?;
        log::info!(
            "detection service counted {}; image saved to {}",
            reply.payload.headcount,
            path.display()
        );
        Ok(reply.payload)
    }

    pub fn health(&self) -> HealthReport {
        let camera = self.pipeline.camera_status();
        HealthReport {
            status: "ok",
            camera: camera.source,
            camera_healthy: camera.healthy,
            frames_captured: camera.frames_captured,
            detector: self.pipeline.detector_name(),
        }
    }
}
