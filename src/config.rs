use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::annotate::AnnotationStyle;
use crate::detect::DetectionFilter;
use crate::encoding::DEFAULT_JPEG_QUALITY;

const DEFAULT_API_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_MAX_IN_FLIGHT: usize = 8;
const DEFAULT_CAMERA: &str = "stub://camera";
const DEFAULT_CAMERA_FPS: u32 = 10;
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_CAMERA_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_CASCADE_PATH: &str = "haarcascade_frontalface_alt.xml";
const DEFAULT_MODEL_PATH: &str = "yolov3.onnx";
const DEFAULT_LABELS_PATH: &str = "coco.names";
const DEFAULT_MODEL_INPUT: u32 = 416;
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_NMS_IOU: f32 = 0.45;
const DEFAULT_INFERENCE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SERVICE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_CAPTURE_PATH: &str = "captured.jpg";
const DEFAULT_DETECTED_PATH: &str = "detected.jpg";

#[derive(Debug, Deserialize, Default)]
struct HeadcountConfigFile {
    api: Option<ApiConfigFile>,
    camera: Option<CameraConfigFile>,
    detector: Option<DetectorConfigFile>,
    annotation: Option<AnnotationConfigFile>,
    detection_service: Option<DetectionServiceConfigFile>,
    storage: Option<StorageConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    max_in_flight: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    read_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    kind: Option<String>,
    cascade_path: Option<PathBuf>,
    scale_factor: Option<f32>,
    min_neighbors: Option<u32>,
    min_size: Option<u32>,
    model_path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    confidence_threshold: Option<f32>,
    classes: Option<Vec<String>>,
    nms_iou: Option<f32>,
    stub_boxes: Option<Vec<[u32; 4]>>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct AnnotationConfigFile {
    color: Option<[u8; 3]>,
    thickness: Option<u32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionServiceConfigFile {
    url: Option<String>,
    token: Option<String>,
    timeout_ms: Option<u64>,
    max_image_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    capture_path: Option<PathBuf>,
    detected_path: Option<PathBuf>,
}

/// Fully resolved service configuration.
#[derive(Debug, Clone)]
pub struct HeadcountConfig {
    pub api: ApiSettings,
    pub camera: CameraSettings,
    pub detector: DetectorSettings,
    pub annotation: AnnotationStyle,
    pub jpeg_quality: u8,
    pub detection_service: DetectionServiceSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub addr: String,
    /// Connections handled concurrently before new ones get 503 `busy`.
    pub max_in_flight: usize,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    /// `stub://`, `file://`, image path, `http(s)://` or V4L2 device.
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub read_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    Stub,
    Cascade,
    Yolo,
}

impl std::str::FromStr for DetectorKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stub" => Ok(DetectorKind::Stub),
            "cascade" | "haar" => Ok(DetectorKind::Cascade),
            "yolo" | "nn" => Ok(DetectorKind::Yolo),
            other => Err(anyhow!(
                "unknown detector '{}'; expected stub, cascade or yolo",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub kind: DetectorKind,
    pub cascade_path: PathBuf,
    pub scale_factor: f32,
    pub min_neighbors: u32,
    pub min_size: u32,
    pub model_path: PathBuf,
    pub labels_path: PathBuf,
    pub input_width: u32,
    pub input_height: u32,
    pub confidence_threshold: f32,
    /// Empty means every class is kept.
    pub classes: Vec<String>,
    pub nms_iou: Option<f32>,
    /// Fixed boxes reported by the stub detector.
    pub stub_boxes: Vec<[u32; 4]>,
    pub timeout: Duration,
}

impl DetectorSettings {
    pub fn filter(&self) -> DetectionFilter {
        DetectionFilter {
            min_confidence: Some(self.confidence_threshold),
            classes: (!self.classes.is_empty()).then(|| self.classes.clone()),
            nms_iou: self.nms_iou,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectionServiceSettings {
    /// Upload endpoint. `None` leaves `/headcount` answering 503.
    pub url: Option<String>,
    pub token: Option<String>,
    pub timeout: Duration,
    pub max_image_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub capture_path: PathBuf,
    pub detected_path: PathBuf,
}

impl HeadcountConfig {
    /// Load from the file named by `HEADCOUNT_CONFIG` (if any), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("HEADCOUNT_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => HeadcountConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: HeadcountConfigFile) -> Result<Self> {
        let api_file = file.api.unwrap_or_default();
        let api = ApiSettings {
            addr: api_file.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            max_in_flight: api_file.max_in_flight.unwrap_or(DEFAULT_MAX_IN_FLIGHT),
        };

        let camera_file = file.camera.unwrap_or_default();
        let camera = CameraSettings {
            source: camera_file
                .source
                .unwrap_or_else(|| DEFAULT_CAMERA.to_string()),
            width: camera_file.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
            height: camera_file.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
            target_fps: camera_file.target_fps.unwrap_or(DEFAULT_CAMERA_FPS),
            read_timeout: Duration::from_millis(
                camera_file
                    .read_timeout_ms
                    .unwrap_or(DEFAULT_CAMERA_TIMEOUT_MS),
            ),
        };

        let detector_file = file.detector.unwrap_or_default();
        let kind = match detector_file.kind.as_deref() {
            Some(kind) => kind.parse()?,
            None => DetectorKind::Cascade,
        };
        let mut detector = DetectorSettings {
            kind,
            cascade_path: detector_file
                .cascade_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CASCADE_PATH)),
            scale_factor: detector_file.scale_factor.unwrap_or(1.1),
            min_neighbors: detector_file.min_neighbors.unwrap_or(3),
            min_size: detector_file.min_size.unwrap_or(0),
            model_path: detector_file
                .model_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
            labels_path: detector_file
                .labels_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LABELS_PATH)),
            input_width: detector_file.input_width.unwrap_or(DEFAULT_MODEL_INPUT),
            input_height: detector_file.input_height.unwrap_or(DEFAULT_MODEL_INPUT),
            confidence_threshold: detector_file
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE),
            classes: detector_file.classes.unwrap_or_default(),
            nms_iou: detector_file.nms_iou,
            stub_boxes: detector_file.stub_boxes.unwrap_or_default(),
            timeout: Duration::from_millis(
                detector_file
                    .timeout_ms
                    .unwrap_or(DEFAULT_INFERENCE_TIMEOUT_MS),
            ),
        };
        if detector.kind == DetectorKind::Yolo {
            apply_yolo_defaults(&mut detector);
        }

        let annotation_file = file.annotation.unwrap_or_default();
        let defaults = AnnotationStyle::default();
        let annotation = AnnotationStyle {
            color: annotation_file.color.unwrap_or(defaults.color),
            thickness: annotation_file.thickness.unwrap_or(defaults.thickness),
        };
        let jpeg_quality = annotation_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY);

        let service_file = file.detection_service.unwrap_or_default();
        let detection_service = DetectionServiceSettings {
            url: service_file.url.filter(|url| !url.trim().is_empty()),
            token: service_file.token.filter(|token| !token.trim().is_empty()),
            timeout: Duration::from_millis(
                service_file
                    .timeout_ms
                    .unwrap_or(DEFAULT_SERVICE_TIMEOUT_MS),
            ),
            max_image_bytes: service_file
                .max_image_bytes
                .unwrap_or(DEFAULT_MAX_IMAGE_BYTES),
        };

        let storage_file = file.storage.unwrap_or_default();
        let storage = StorageSettings {
            capture_path: storage_file
                .capture_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CAPTURE_PATH)),
            detected_path: storage_file
                .detected_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DETECTED_PATH)),
        };

        Ok(Self {
            api,
            camera,
            detector,
            annotation,
            jpeg_quality,
            detection_service,
            storage,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("HEADCOUNT_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api.addr = addr;
            }
        }
        if let Ok(source) = std::env::var("HEADCOUNT_CAMERA") {
            if !source.trim().is_empty() {
                self.camera.source = source;
            }
        }
        if let Ok(kind) = std::env::var("HEADCOUNT_DETECTOR") {
            if !kind.trim().is_empty() {
                self.detector.kind = kind.parse()?;
                if self.detector.kind == DetectorKind::Yolo {
                    apply_yolo_defaults(&mut self.detector);
                }
            }
        }
        if let Ok(confidence) = std::env::var("HEADCOUNT_CONFIDENCE") {
            self.detector.confidence_threshold = confidence
                .trim()
                .parse()
                .map_err(|_| anyhow!("HEADCOUNT_CONFIDENCE must be a number between 0 and 1"))?;
        }
        if let Ok(url) = std::env::var("HEADCOUNT_DETECTION_SERVICE_URL") {
            if !url.trim().is_empty() {
                self.detection_service.url = Some(url);
            }
        }
        if let Ok(token) = std::env::var("HEADCOUNT_DETECTION_SERVICE_TOKEN") {
            if !token.trim().is_empty() {
                self.detection_service.token = Some(token);
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.api
            .addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid api addr '{}'", self.api.addr))?;
        if self.api.max_in_flight == 0 {
            return Err(anyhow!("api max_in_flight must be greater than zero"));
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be greater than zero"));
        }
        if self.camera.read_timeout.is_zero() {
            return Err(anyhow!("camera read timeout must be greater than zero"));
        }

        let detector = &self.detector;
        if !(0.0..=1.0).contains(&detector.confidence_threshold) {
            return Err(anyhow!(
                "confidence threshold {} is outside [0, 1]",
                detector.confidence_threshold
            ));
        }
        if let Some(iou) = detector.nms_iou {
            if !(iou > 0.0 && iou <= 1.0) {
                return Err(anyhow!("nms_iou {} is outside (0, 1]", iou));
            }
        }
        if detector.timeout.is_zero() {
            return Err(anyhow!("detector timeout must be greater than zero"));
        }
        match detector.kind {
            DetectorKind::Stub => {}
            DetectorKind::Cascade => {
                if detector.scale_factor <= 1.0 {
                    return Err(anyhow!("cascade scale_factor must be greater than 1"));
                }
                require_file("cascade", &detector.cascade_path)?;
            }
            DetectorKind::Yolo => {
                if detector.input_width == 0 || detector.input_height == 0 {
                    return Err(anyhow!("model input size must be greater than zero"));
                }
                require_file("model", &detector.model_path)?;
                require_file("class names", &detector.labels_path)?;
            }
        }

        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!("jpeg quality {} is outside 1..=100", self.jpeg_quality));
        }
        if self.annotation.thickness == 0 {
            return Err(anyhow!("annotation thickness must be at least 1"));
        }

        let service = &self.detection_service;
        if let Some(raw) = &service.url {
            let url = url::Url::parse(raw)
                .with_context(|| format!("invalid detection service url '{}'", raw))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(anyhow!("detection service url must be http or https"));
            }
        }
        if service.timeout.is_zero() {
            return Err(anyhow!("detection service timeout must be greater than zero"));
        }
        if service.max_image_bytes == 0 {
            return Err(anyhow!("detection service max_image_bytes must be greater than zero"));
        }
        Ok(())
    }
}

/// The network path keeps only confident, de-duplicated people unless told
/// otherwise.
fn apply_yolo_defaults(detector: &mut DetectorSettings) {
    if detector.classes.is_empty() {
        detector.classes = vec!["person".to_string()];
    }
    if detector.nms_iou.is_none() {
        detector.nms_iou = Some(DEFAULT_NMS_IOU);
    }
}

fn require_file(what: &str, path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(anyhow!("{} file {} not found", what, path.display()))
    }
}

fn read_config_file(path: &Path) -> Result<HeadcountConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<HeadcountConfig> {
        HeadcountConfig::from_file(toml::from_str(raw)?)
    }

    #[test]
    fn defaults_match_cascade_service() -> Result<()> {
        let cfg = HeadcountConfig::from_file(HeadcountConfigFile::default())?;
        assert_eq!(cfg.api.addr, DEFAULT_API_ADDR);
        assert_eq!(cfg.camera.source, "stub://camera");
        assert_eq!(cfg.detector.kind, DetectorKind::Cascade);
        assert_eq!(cfg.detector.min_neighbors, 3);
        assert_eq!(cfg.detector.min_size, 0);
        assert!(cfg.detector.classes.is_empty());
        assert_eq!(cfg.annotation, AnnotationStyle::default());
        assert_eq!(cfg.jpeg_quality, 90);
        assert!(cfg.detection_service.url.is_none());
        Ok(())
    }

    #[test]
    fn cascade_min_size_is_configurable() -> Result<()> {
        let cfg = parse("[detector]\nmin_size = 40\n")?;
        assert_eq!(cfg.detector.min_size, 40);
        Ok(())
    }

    #[test]
    fn yolo_defaults_to_people_with_nms() -> Result<()> {
        let cfg = parse("[detector]\nkind = \"yolo\"\nconfidence_threshold = 0.99\n")?;
        let filter = cfg.detector.filter();
        assert_eq!(filter.min_confidence, Some(0.99));
        assert_eq!(filter.classes, Some(vec!["person".to_string()]));
        assert_eq!(filter.nms_iou, Some(DEFAULT_NMS_IOU));
        Ok(())
    }

    #[test]
    fn missing_cascade_file_fails_validation() -> Result<()> {
        let cfg = parse("[detector]\ncascade_path = \"/nonexistent/cascade.xml\"\n")?;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/cascade.xml"));
        Ok(())
    }

    #[test]
    fn out_of_range_values_are_rejected() -> Result<()> {
        for raw in [
            "[detector]\nkind = \"stub\"\nconfidence_threshold = 1.5\n",
            "[detector]\nkind = \"stub\"\n[annotation]\njpeg_quality = 0\n",
            "[detector]\nkind = \"stub\"\n[annotation]\nthickness = 0\n",
            "[detector]\nkind = \"stub\"\n[camera]\nread_timeout_ms = 0\n",
            "[detector]\nkind = \"stub\"\n[detection_service]\nurl = \"not a url\"\n",
            "[detector]\nkind = \"stub\"\n[api]\naddr = \"localhost\"\n",
        ] {
            let cfg = parse(raw)?;
            assert!(cfg.validate().is_err(), "accepted: {raw}");
        }
        Ok(())
    }

    #[test]
    fn unknown_detector_kind_is_rejected() {
        assert!(parse("[detector]\nkind = \"hog\"\n").is_err());
    }
}
