use anyhow::{anyhow, Result};
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use headcount::api::{ApiHandle, ApiServer};
use headcount::config::{ApiSettings, StorageSettings};
use headcount::detect::StubBackend;
use headcount::encoding::{decode_base64_image, decode_image};
use headcount::store::FrameStore;
use headcount::{
    AnnotationStyle, DetectionFilter, Frame, FrameSource, HeadcountPipeline, HeadcountService,
    PipelineSettings, SourceStats,
};

/// Camera that serves a fixed list of frames, then empty frames.
struct ScriptedCamera {
    frames: Vec<Frame>,
    served: u64,
}

impl FrameSource for ScriptedCamera {
    fn describe(&self) -> String {
        "scripted://camera".to_string()
    }

    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.served += 1;
        if self.frames.is_empty() {
            return Ok(Frame::empty(self.served));
        }
        Ok(self.frames.remove(0))
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.served,
            source: self.describe(),
        }
    }
}

fn gray_frame(sequence: u64) -> Frame {
    Frame::from_image(
        image::RgbImage::from_pixel(200, 200, image::Rgb([90, 90, 90])),
        sequence,
    )
}

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

fn request(addr: std::net::SocketAddr, method: &str, path: &str) -> Result<(String, Value)> {
    let mut stream = TcpStream::connect(addr)?;
    let request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
    stream.write_all(request.as_bytes())?;
    let (headers, body) = read_response(&mut stream)?;
    let json = serde_json::from_str(&body).map_err(|e| anyhow!("bad body {body:?}: {e}"))?;
    Ok((headers, json))
}

struct TestApi {
    dir: tempfile::TempDir,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(frames: Vec<Frame>, boxes: Vec<[u32; 4]>) -> Result<Self> {
        let dir = tempdir()?;
        let pipeline = HeadcountPipeline::new(
            Box::new(ScriptedCamera { frames, served: 0 }),
            Box::new(StubBackend::new(boxes)),
            PipelineSettings {
                filter: DetectionFilter::default(),
                style: AnnotationStyle::default(),
                jpeg_quality: 90,
                camera_timeout: Duration::from_secs(2),
                detector_timeout: Duration::from_secs(2),
            },
        )?;
        let store = FrameStore::new(&StorageSettings {
            capture_path: dir.path().join("captured.jpg"),
            detected_path: dir.path().join("detected.jpg"),
        });
        let service = Arc::new(HeadcountService::new(pipeline, store, None));

        let api_settings = ApiSettings {
            addr: "127.0.0.1:0".to_string(),
            max_in_flight: 4,
        };
        let api_handle = ApiServer::new(api_settings, service).spawn()?;

        Ok(Self {
            dir,
            api_handle: Some(api_handle),
        })
    }

    fn addr(&self) -> std::net::SocketAddr {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
            .addr
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

#[test]
fn capture_returns_headcount_and_annotated_jpeg() -> Result<()> {
    let api = TestApi::new(vec![gray_frame(1)], vec![[10, 10, 50, 50], [100, 100, 30, 30]])?;

    let (headers, body) = request(api.addr(), "GET", "/capture")?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("Content-Type: application/json"));
    assert_eq!(body["headcount"], 2);

    let image = body["image"].as_str().unwrap();
    assert!(image.starts_with("data:image/jpg;base64,"));
    let decoded = decode_image(&decode_base64_image(image)?)?;
    assert_eq!(decoded.dimensions(), (200, 200));

    // Box edges are green, box interiors keep the frame color.
    let edge = decoded.get_pixel(35, 10);
    assert!(edge[1] > 150 && edge[0] < 120, "edge pixel {edge:?}");
    let inside = decoded.get_pixel(35, 35);
    assert!((inside[1] as i32 - 90).abs() < 20, "inside pixel {inside:?}");
    Ok(())
}

#[test]
fn empty_frame_is_reported_without_headcount() -> Result<()> {
    let api = TestApi::new(vec![], vec![[10, 10, 50, 50]])?;

    let (headers, body) = request(api.addr(), "GET", "/capture")?;
    assert!(headers.contains("503 Service Unavailable"));
    assert_eq!(body["error"], "capture_failed");
    assert!(body.get("headcount").is_none());
    assert!(body.get("image").is_none());
    Ok(())
}

#[test]
fn post_capture_persists_frame() -> Result<()> {
    let api = TestApi::new(vec![gray_frame(1)], vec![])?;

    let (headers, body) = request(api.addr(), "POST", "/capture")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body["message"], "Image captured successfully");
    let path = body["path"].as_str().unwrap();
    assert_eq!(Path::new(path), api.path("captured.jpg"));

    let saved = decode_image(&std::fs::read(path)?)?;
    assert_eq!(saved.dimensions(), (200, 200));
    Ok(())
}

#[test]
fn headcount_without_detection_service_is_unavailable() -> Result<()> {
    let api = TestApi::new(vec![gray_frame(1)], vec![])?;
    request(api.addr(), "POST", "/capture")?;

    let (headers, body) = request(api.addr(), "GET", "/headcount")?;
    assert!(headers.contains("503 Service Unavailable"));
    assert_eq!(body["error"], "detection_service_unconfigured");
    assert!(!api.path("detected.jpg").exists());
    Ok(())
}

#[test]
fn health_reports_camera_and_detector() -> Result<()> {
    let api = TestApi::new(vec![gray_frame(1)], vec![])?;
    request(api.addr(), "GET", "/capture")?;

    let (headers, body) = request(api.addr(), "GET", "/health")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body["status"], "ok");
    assert_eq!(body["camera"], "scripted://camera");
    assert_eq!(body["camera_healthy"], true);
    assert_eq!(body["frames_captured"], 1);
    assert_eq!(body["detector"], "stub");
    Ok(())
}

#[test]
fn unknown_routes_and_methods_are_rejected() -> Result<()> {
    let api = TestApi::new(vec![], vec![])?;

    let (headers, body) = request(api.addr(), "GET", "/events")?;
    assert!(headers.contains("404 Not Found"));
    assert_eq!(body["error"], "not_found");

    let (headers, body) = request(api.addr(), "DELETE", "/capture")?;
    assert!(headers.contains("405 Method Not Allowed"));
    assert_eq!(body["error"], "method_not_allowed");

    let (headers, _) = request(api.addr(), "POST", "/headcount")?;
    assert!(headers.contains("405 Method Not Allowed"));
    Ok(())
}
