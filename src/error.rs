//! Per-request error taxonomy.
//!
//! Backends and startup code speak `anyhow`; everything that reaches the HTTP
//! boundary is converted into a `HeadcountError` so that the status code and
//! the `error` kind in the response body are decided in one place.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum HeadcountError {
    /// Camera or model unavailable while building the service. Fatal.
    #[error("startup failed: {0}")]
    Startup(String),

    /// Empty frame or camera read error.
    #[error("capture failed: {0}")]
    Capture(String),

    /// A bounded wait on the camera, detector or detection service elapsed.
    #[error("{stage} timed out after {}ms", .after.as_millis())]
    Timeout { stage: &'static str, after: Duration },

    #[error("detection failed: {0}")]
    Detection(String),

    /// Remote detection service unreachable, non-2xx or malformed reply.
    #[error("detection service error: {0}")]
    DetectionService(String),

    #[error("no detection service configured")]
    ServiceNotConfigured,

    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("no captured image found at {}", .0.display())]
    NoCapturedImage(PathBuf),

    #[error("storage failed: {0}")]
    Storage(String),
}

impl HeadcountError {
    /// Stable machine-readable kind, used as the `error` field of responses.
    pub fn kind(&self) -> &'static str {
        match self {
            HeadcountError::Startup(_) => "startup_failed",
            HeadcountError::Capture(_) => "capture_failed",
            HeadcountError::Timeout { .. } => "timeout",
            HeadcountError::Detection(_) => "detection_failed",
            HeadcountError::DetectionService(_) => "detection_service_failed",
            HeadcountError::ServiceNotConfigured => "detection_service_unconfigured",
            HeadcountError::Encoding(_) => "encoding_failed",
            HeadcountError::NoCapturedImage(_) => "no_captured_image",
            HeadcountError::Storage(_) => "storage_failed",
        }
    }

    /// HTTP status for this failure. 4xx for missing preconditions on the
    /// caller's side, 5xx for backend failures.
    pub fn status(&self) -> u16 {
        match self {
            HeadcountError::NoCapturedImage(_) => 404,
            HeadcountError::Capture(_) | HeadcountError::ServiceNotConfigured => 503,
            HeadcountError::Timeout { .. } => 504,
            HeadcountError::DetectionService(_) => 502,
            HeadcountError::Startup(_)
            | HeadcountError::Detection(_)
            | HeadcountError::Encoding(_)
            | HeadcountError::Storage(_) => 500,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        }
    }

    pub(crate) fn capture(err: anyhow::Error) -> Self {
        HeadcountError::Capture(format!("{err:#}"))
    }

    pub(crate) fn detection(err: anyhow::Error) -> Self {
        HeadcountError::Detection(format!("{err:#}"))
    }

    pub(crate) fn encoding(err: anyhow::Error) -> Self {
        HeadcountError::Encoding(format!("{err:#}"))
    }

    pub(crate) fn storage(err: anyhow::Error) -> Self {
        HeadcountError::Storage(format!("{err:#}"))
    }
}

/// JSON error body returned on every non-2xx response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}
