//! Headcount service
//!
//! Captures a camera frame, counts the people or faces in it, draws a box
//! around each one and answers with the count and the annotated JPEG.
//!
//! # Detection paths
//!
//! - **Cascade**: Haar cascade face detection from an OpenCV cascade XML.
//! - **YOLO**: an ONNX object detector (feature `backend-tract`), filtered
//!   to confident `person` boxes.
//! - **Remote**: `POST /capture` persists a frame and `GET /headcount` hands
//!   it to an external detection service, relaying its answer.
//!
//! # Module Structure
//!
//! - `ingest`: camera sources (synthetic, still image, HTTP snapshot, V4L2)
//! - `detect`: detector backends and post-detection filtering
//! - `pipeline`: capture, detect, annotate and encode one frame
//! - `service` / `api`: the HTTP surface

pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod encoding;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod service;
pub mod store;
pub mod transport;
pub mod worker;

pub use annotate::AnnotationStyle;
pub use config::HeadcountConfig;
pub use detect::{Detection, DetectionFilter, DetectorBackend};
pub use error::HeadcountError;
pub use frame::Frame;
pub use ingest::{FrameSource, SourceStats};
pub use pipeline::{HeadcountPayload, HeadcountPipeline, PipelineSettings};
pub use service::{CaptureReceipt, HeadcountService, HealthReport};
