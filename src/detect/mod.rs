mod backend;
mod backends;
mod filter;
mod result;

use anyhow::Result;

use crate::config::{DetectorKind, DetectorSettings};

pub use backend::DetectorBackend;
pub use backends::{
    decode_rows, CascadeBackend, CascadeParams, ClassLabels, HaarCascade, StubBackend,
};
#[cfg(feature = "backend-tract")]
pub use backends::TractYoloBackend;
pub use filter::{non_max_suppression, DetectionFilter};
pub use result::Detection;

/// Load the configured detector. Model files are read here, so a missing or
/// malformed model fails startup rather than the first request.
pub fn build_detector(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    let mut backend: Box<dyn DetectorBackend> = match settings.kind {
        DetectorKind::Stub => Box::new(StubBackend::new(settings.stub_boxes.clone())),
        DetectorKind::Cascade => Box::new(CascadeBackend::from_path(
            &settings.cascade_path,
            CascadeParams {
                scale_factor: settings.scale_factor,
                min_neighbors: settings.min_neighbors,
                min_size: settings.min_size,
            },
        )?),
        DetectorKind::Yolo => build_yolo(settings)?,
    };
    backend.warm_up()?;
    log::info!("detector ready: {}", backend.name());
    Ok(backend)
}

#[cfg(feature = "backend-tract")]
fn build_yolo(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    Ok(Box::new(TractYoloBackend::new(
        &settings.model_path,
        &settings.labels_path,
        settings.input_width,
        settings.input_height,
    )?))
}

#[cfg(not(feature = "backend-tract"))]
fn build_yolo(_settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    Err(anyhow::anyhow!(
        "the yolo detector requires the backend-tract feature"
    ))
}
