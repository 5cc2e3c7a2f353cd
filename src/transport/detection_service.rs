//! Remote detection service client.
//!
//! Uploads a JPEG as the multipart field `file` and expects
//! `{"headcount": N, "image": "<base64>"}` back. The reply crosses a trust
//! boundary, so it is checked before anything is persisted: the headcount
//! must be a non-negative integer and the image must decode, within the
//! configured size cap.

use anyhow::{Context, Result};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Client;
use std::io::Read;
use std::time::Duration;

use crate::config::DetectionServiceSettings;
use crate::encoding::{decode_base64_image, decode_image};
use crate::error::HeadcountError;
use crate::pipeline::HeadcountPayload;

const STAGE: &str = "detection service";

/// A validated detection service reply.
#[derive(Debug)]
pub struct RemoteHeadcount {
    /// The reply exactly as received, for relaying to the caller.
    pub payload: HeadcountPayload,
    /// Decoded annotated image bytes.
    pub image: Vec<u8>,
}

pub struct DetectionServiceClient {
    url: String,
    token: Option<String>,
    timeout: Duration,
    max_image_bytes: usize,
    client: Client,
}

impl DetectionServiceClient {
    /// Build a client for `settings.url`. Returns `Ok(None)` when no service
    /// is configured.
    pub fn from_settings(settings: &DetectionServiceSettings) -> Result<Option<Self>> {
        let Some(url) = settings.url.clone() else {
            return Ok(None);
        };
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .context("failed to build detection service client")?;
        log::info!("detection service: {}", url);
        Ok(Some(Self {
            url,
            token: settings.token.clone(),
            timeout: settings.timeout,
            max_image_bytes: settings.max_image_bytes,
            client,
        }))
    }

    /// Upload `jpeg` and return the validated reply.
    pub fn detect(&self, jpeg: Vec<u8>) -> Result<RemoteHeadcount, HeadcountError> {
        let part = Part::bytes(jpeg)
            .file_name("captured.jpg")
            .mime_str("image/jpeg")
            .map_err(|err| self.failed(format!("invalid upload part: {err}")))?;
        let mut request = self
            .client
            .post(&self.url)
            .multipart(Form::new().part("file", part));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().map_err(|err| {
            if err.is_timeout() {
                self.timed_out()
            } else {
                self.failed(format!("request failed: {err}"))
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(self.failed(format!("returned status {}", status.as_u16())));
        }

        // base64 inflates by 4/3; leave room for the JSON envelope.
        let body_limit = (self.max_image_bytes / 3 + 1) * 4 + 4096;
        let mut body = Vec::new();
        response
            .take(body_limit as u64 + 1)
            .read_to_end(&mut body)
            .map_err(|err| {
                if is_read_timeout(&err) {
                    self.timed_out()
                } else {
                    self.failed(format!("failed to read reply: {err}"))
                }
            })?;
        if body.len() > body_limit {
            return Err(self.failed(format!("reply exceeds {body_limit} bytes")));
        }

        self.validate(&body)
    }

    fn validate(&self, body: &[u8]) -> Result<RemoteHeadcount, HeadcountError> {
        let payload: HeadcountPayload = serde_json::from_slice(body)
            .map_err(|err| self.failed(format!("malformed reply: {err}")))?;
        let image = decode_base64_image(&payload.image)
            .map_err(|err| self.failed(format!("reply image: {err:#}")))?;
        if image.len() > self.max_image_bytes {
            return Err(self.failed(format!(
                "reply image is {} bytes, limit {}",
                image.len(),
                self.max_image_bytes
            )));
        }
        decode_image(&image).map_err(|err| self.failed(format!("reply image: {err:#}")))?;
        Ok(RemoteHeadcount { payload, image })
    }

    fn failed(&self, message: String) -> HeadcountError {
        HeadcountError::DetectionService(format!("{}: {}", self.url, message))
    }

    fn timed_out(&self) -> HeadcountError {
        HeadcountError::Timeout {
            stage: STAGE,
            after: self.timeout,
        }
    }
}

/// Body reads surface reqwest's timeout wrapped in an `io::Error`.
fn is_read_timeout(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::TimedOut
        || err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
            .is_some_and(reqwest::Error::is_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::encode_jpeg;
    use base64::prelude::{Engine as _, BASE64_STANDARD};

    #[test]
    fn timed_out_body_reads_are_recognized() {
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "stalled");
        assert!(is_read_timeout(&timed_out));
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(!is_read_timeout(&reset));
    }

    fn client(max_image_bytes: usize) -> DetectionServiceClient {
        DetectionServiceClient::from_settings(&DetectionServiceSettings {
            url: Some("http://127.0.0.1:9/detect".to_string()),
            token: None,
            timeout: Duration::from_secs(1),
            max_image_bytes,
        })
        .unwrap()
        .unwrap()
    }

    fn jpeg_b64() -> String {
        let jpeg = encode_jpeg(&image::RgbImage::new(16, 16), 90).unwrap();
        BASE64_STANDARD.encode(jpeg)
    }

    #[test]
    fn unconfigured_service_builds_no_client() {
        let settings = DetectionServiceSettings {
            url: None,
            token: None,
            timeout: Duration::from_secs(1),
            max_image_bytes: 1024,
        };
        assert!(DetectionServiceClient::from_settings(&settings)
            .unwrap()
            .is_none());
    }

    #[test]
    fn valid_reply_keeps_original_image_string() {
        let image = jpeg_b64();
        let body = format!(r#"{{"headcount": 3, "image": "{image}"}}"#);
        let reply = client(1 << 20).validate(body.as_bytes()).unwrap();
        assert_eq!(reply.payload.headcount, 3);
        assert_eq!(reply.payload.image, image);
        assert_eq!(&reply.image[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn invalid_replies_are_rejected() {
        let image = jpeg_b64();
        let not_an_image = BASE64_STANDARD.encode(b"plain text");
        for body in [
            "not json".to_string(),
            format!(r#"{{"headcount": -1, "image": "{image}"}}"#),
            format!(r#"{{"headcount": "2", "image": "{image}"}}"#),
            format!(r#"{{"headcount": 1.5, "image": "{image}"}}"#),
            r#"{"headcount": 1}"#.to_string(),
            r#"{"headcount": 1, "image": "***"}"#.to_string(),
            format!(r#"{{"headcount": 1, "image": "{not_an_image}"}}"#),
        ] {
            let err = client(1 << 20).validate(body.as_bytes()).unwrap_err();
            assert_eq!(err.kind(), "detection_service_failed", "accepted: {body}");
        }
    }

    #[test]
    fn oversized_reply_image_is_rejected() {
        let body = format!(r#"{{"headcount": 1, "image": "{}"}}"#, jpeg_b64());
        let err = client(64).validate(body.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("limit 64"));
    }
}
