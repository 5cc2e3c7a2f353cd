//! Outbound transport to the remote detection service.

mod detection_service;

pub use detection_service::{DetectionServiceClient, RemoteHeadcount};
