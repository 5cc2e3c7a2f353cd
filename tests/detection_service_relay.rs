use anyhow::{anyhow, Result};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tempfile::tempdir;

use headcount::api::{ApiHandle, ApiServer};
use headcount::config::{ApiSettings, DetectionServiceSettings, StorageSettings};
use headcount::detect::StubBackend;
use headcount::encoding::encode_jpeg;
use headcount::ingest::SyntheticSource;
use headcount::store::FrameStore;
use headcount::transport::DetectionServiceClient;
use headcount::{
    AnnotationStyle, DetectionFilter, HeadcountPipeline, HeadcountService, PipelineSettings,
};

/// One-shot stand-in for the remote detection service. Records the raw
/// request it received and answers with a canned status and body.
struct FakeDetectionService {
    addr: SocketAddr,
    requests: Receiver<Vec<u8>>,
    join: Option<JoinHandle<()>>,
}

impl FakeDetectionService {
    fn spawn(status: u16, body: String, delay: Duration) -> Result<Self> {
        Self::spawn_with_body_stall(status, body, delay, Duration::ZERO)
    }

    /// Answers after `delay`, then sends the headers and half the body and
    /// waits `stall` before sending the rest.
    fn spawn_with_body_stall(
        status: u16,
        body: String,
        delay: Duration,
        stall: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let (tx, requests) = mpsc::channel();
        let join = std::thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            if let Ok(request) = read_http_request(&mut stream) {
                let _ = tx.send(request);
            }
            std::thread::sleep(delay);
            let response = format!(
                "HTTP/1.1 {status} Fake\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let (head, tail) = response.as_bytes().split_at(response.len() - body.len() / 2);
            let _ = stream.write_all(head);
            let _ = stream.flush();
            std::thread::sleep(stall);
            let _ = stream.write_all(tail);
        });
        Ok(Self {
            addr,
            requests,
            join: Some(join),
        })
    }

    fn url(&self) -> String {
        format!("http://{}/detect", self.addr)
    }

    fn received(&self) -> Result<String> {
        let raw = self.requests.recv_timeout(Duration::from_secs(5))?;
        Ok(String::from_utf8_lossy(&raw).to_lowercase())
    }
}

impl Drop for FakeDetectionService {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn read_http_request(stream: &mut TcpStream) -> Result<Vec<u8>> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let headers = String::from_utf8_lossy(&data[..header_end]).to_lowercase();
    let content_length = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok());
    loop {
        let body = &data[header_end..];
        let complete = match content_length {
            Some(len) => body.len() >= len,
            None => body.ends_with(b"0\r\n\r\n"),
        };
        if complete {
            return Ok(data);
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Ok(data);
        }
        data.extend_from_slice(&buf[..n]);
    }
}

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

fn request(addr: SocketAddr, method: &str, path: &str) -> Result<(String, Value)> {
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
    fn new(service_url: String, timeout: Duration) -> Result<Self> {
        let dir = tempdir()?;
        let pipeline = HeadcountPipeline::new(
            Box::new(SyntheticSource::new("stub://relay", 64, 48)),
            Box::new(StubBackend::default()),
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
        let remote = DetectionServiceClient::from_settings(&DetectionServiceSettings {
            url: Some(service_url),
            token: Some("secret".to_string()),
            timeout,
            max_image_bytes: 1 << 20,
        })?;
        let service = Arc::new(HeadcountService::new(pipeline, store, remote));
        let api_handle = ApiServer::new(
            ApiSettings {
                addr: "127.0.0.1:0".to_string(),
                max_in_flight: 4,
            },
            service,
        )
        .spawn()?;
        Ok(Self {
            dir,
            api_handle: Some(api_handle),
        })
    }

    fn addr(&self) -> SocketAddr {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
            .addr
    }

    fn detected_path(&self) -> std::path::PathBuf {
        self.dir.path().join("detected.jpg")
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn annotated_jpeg() -> Result<Vec<u8>> {
    let image = image::RgbImage::from_pixel(64, 48, image::Rgb([0, 255, 0]));
    encode_jpeg(&image, 90)
}

#[test]
fn relays_service_reply_and_persists_image() -> Result<()> {
    let jpeg = annotated_jpeg()?;
    let image = BASE64_STANDARD.encode(&jpeg);
    let fake = FakeDetectionService::spawn(
        200,
        format!(r#"{{"headcount": 4, "image": "{image}"}}"#),
        Duration::ZERO,
    )?;
    let api = TestApi::new(fake.url(), Duration::from_secs(5))?;

    let (headers, _) = request(api.addr(), "POST", "/capture")?;
    assert!(headers.contains("200 OK"));

    let (headers, body) = request(api.addr(), "GET", "/headcount")?;
    assert!(headers.contains("200 OK"), "{headers}");
    assert_eq!(body["headcount"], 4);
    assert_eq!(body["image"], image.as_str());
    assert_eq!(std::fs::read(api.detected_path())?, jpeg);

    let upload = fake.received()?;
    assert!(upload.starts_with("post /detect"));
    assert!(upload.contains("authorization: bearer secret"));
    assert!(upload.contains("multipart/form-data"));
    assert!(upload.contains("name=\"file\""));
    assert!(upload.contains("image/jpeg"));
    Ok(())
}

#[test]
fn missing_capture_is_not_found() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let url = format!("http://{}/detect", listener.local_addr()?);
    let api = TestApi::new(url, Duration::from_secs(1))?;

    let (headers, body) = request(api.addr(), "GET", "/headcount")?;
    assert!(headers.contains("404 Not Found"));
    assert_eq!(body["error"], "no_captured_image");
    Ok(())
}

#[test]
fn service_down_is_bad_gateway_and_leaves_no_file() -> Result<()> {
    let url = {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        format!("http://{}/detect", listener.local_addr()?)
    };
    let api = TestApi::new(url, Duration::from_secs(2))?;
    request(api.addr(), "POST", "/capture")?;

    let (headers, body) = request(api.addr(), "GET", "/headcount")?;
    assert!(headers.contains("502 Bad Gateway"), "{headers}");
    assert_eq!(body["error"], "detection_service_failed");
    assert!(body.get("headcount").is_none());
    assert!(!api.detected_path().exists());
    Ok(())
}

#[test]
fn error_status_and_malformed_replies_keep_previous_file() -> Result<()> {
    for (status, reply) in [
        (500, r#"{"error": "model crashed"}"#.to_string()),
        (200, r#"{"headcount": 2, "image": "not base64!"}"#.to_string()),
        (200, r#"{"count": 2}"#.to_string()),
    ] {
        let fake = FakeDetectionService::spawn(status, reply.clone(), Duration::ZERO)?;
        let api = TestApi::new(fake.url(), Duration::from_secs(5))?;
        std::fs::write(api.detected_path(), b"previous")?;
        request(api.addr(), "POST", "/capture")?;

        let (headers, body) = request(api.addr(), "GET", "/headcount")?;
        assert!(headers.contains("502 Bad Gateway"), "{reply}: {headers}");
        assert_eq!(body["error"], "detection_service_failed");
        assert_eq!(std::fs::read(api.detected_path())?, b"previous");
    }
    Ok(())
}

#[test]
fn slow_service_times_out() -> Result<()> {
    let image = BASE64_STANDARD.encode(annotated_jpeg()?);
    let fake = FakeDetectionService::spawn(
        200,
        format!(r#"{{"headcount": 1, "image": "{image}"}}"#),
        Duration::from_millis(1500),
    )?;
    let api = TestApi::new(fake.url(), Duration::from_millis(300))?;
    request(api.addr(), "POST", "/capture")?;

    let (headers, body) = request(api.addr(), "GET", "/headcount")?;
    assert!(headers.contains("504 Gateway Timeout"), "{headers}");
    assert_eq!(body["error"], "timeout");
    assert!(!api.detected_path().exists());
    Ok(())
}

#[test]
fn stalled_reply_body_times_out() -> Result<()> {
    let image = BASE64_STANDARD.encode(annotated_jpeg()?);
    let fake = FakeDetectionService::spawn_with_body_stall(
        200,
        format!(r#"{{"headcount": 1, "image": "{image}"}}"#),
        Duration::ZERO,
        Duration::from_millis(1500),
    )?;
    let api = TestApi::new(fake.url(), Duration::from_millis(500))?;
    request(api.addr(), "POST", "/capture")?;

    let (headers, body) = request(api.addr(), "GET", "/headcount")?;
    assert!(headers.contains("504 Gateway Timeout"), "{headers}");
    assert_eq!(body["error"], "timeout");
    assert!(!api.detected_path().exists());
    Ok(())
}
