//! HTTP snapshot frame source.
//!
//! Fetches a single JPEG per capture from an IP camera snapshot endpoint
//! (e.g. `http://camera.local/capture`). The JPEG is decoded in-memory.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::{Duration, Instant};

use image::GenericImageView;
use url::Url;

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

const MAX_JPEG_BYTES: u64 = 5 * 1024 * 1024;

pub struct SnapshotSource {
    url: Url,
    agent: ureq::Agent,
    frame_count: u64,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

impl SnapshotSource {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).context("parse snapshot url")?;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(timeout)
            .build();
        Ok(Self {
            url,
            agent,
            frame_count: 0,
            connected_at: None,
            last_error: None,
        })
    }

    fn fetch_jpeg(&self) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(self.url.as_str())
            .call()
            .with_context(|| format!("fetch jpeg snapshot from {}", self.url))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES + 1)
            .read_to_end(&mut bytes)
            .context("read jpeg snapshot")?;
        if bytes.len() as u64 > MAX_JPEG_BYTES {
            return Err(anyhow!("jpeg snapshot exceeds {} bytes", MAX_JPEG_BYTES));
        }
        Ok(bytes)
    }
}

impl FrameSource for SnapshotSource {
    fn describe(&self) -> String {
        self.url.to_string()
    }

    /// Probe the endpoint once so an unreachable camera fails at startup.
    fn connect(&mut self) -> Result<()> {
        self.fetch_jpeg()
            .with_context(|| format!("camera {} not accessible", self.url))?;
        self.connected_at = Some(Instant::now());
        log::info!("SnapshotSource: connected to {}", self.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let bytes = self.fetch_jpeg().map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;
        self.frame_count += 1;
        self.last_error = None;
        if bytes.is_empty() {
            return Ok(Frame::empty(self.frame_count));
        }
        let (pixels, width, height) = decode_jpeg(&bytes)?;
        Frame::from_rgb(pixels, width, height, self.frame_count)
    }

    fn is_healthy(&self) -> bool {
        self.last_error.is_none() && self.connected_at.is_some()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.url.to_string(),
        }
    }
}

fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    let rgb = image.into_rgb8();
    Ok((rgb.into_raw(), width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    fn serve_once(body: Vec<u8>) -> Result<String> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        std::thread::spawn(move || {
            for _ in 0..2 {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut buf = [0u8; 1024];
                let _ = std::io::Read::read(&mut stream, &mut buf);
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(header.as_bytes());
                let _ = stream.write_all(&body);
            }
        });
        Ok(format!("http://{addr}/capture"))
    }

    #[test]
    fn snapshot_source_decodes_served_jpeg() -> Result<()> {
        let image = image::RgbImage::from_pixel(16, 8, image::Rgb([200, 10, 10]));
        let jpeg = crate::encoding::encode_jpeg(&image, 90)?;
        let url = serve_once(jpeg)?;

        let mut source = SnapshotSource::new(&url, Duration::from_secs(2))?;
        source.connect()?;
        let frame = source.next_frame()?;
        assert_eq!((frame.width(), frame.height()), (16, 8));
        assert!(source.is_healthy());
        Ok(())
    }

    #[test]
    fn unreachable_camera_fails_connect() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);

        let mut source =
            SnapshotSource::new(&format!("http://{addr}/capture"), Duration::from_millis(500))?;
        let err = source.connect().unwrap_err();
        assert!(format!("{err:#}").contains("not accessible"));
        Ok(())
    }
}
