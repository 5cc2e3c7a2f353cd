//! JPEG and base64 encoding of annotated frames.

use anyhow::{anyhow, Context, Result};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

/// Prefix of the `image` field in headcount payloads.
pub const DATA_URI_PREFIX: &str = "data:image/jpg;base64,";

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    if image.width() == 0 || image.height() == 0 {
        return Err(anyhow!("cannot encode an empty image"));
    }
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

/// JPEG-encode `image` and wrap it as a `data:` URI.
pub fn jpeg_data_uri(image: &RgbImage, quality: u8) -> Result<String> {
    let jpeg = encode_jpeg(image, quality)?;
    Ok(format!("{DATA_URI_PREFIX}{}", BASE64_STANDARD.encode(jpeg)))
}

/// Decode a base64 image string, with or without a `data:...;base64,` prefix.
pub fn decode_base64_image(value: &str) -> Result<Vec<u8>> {
    let payload = match value.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(";base64,")
            .map(|(_, data)| data)
            .ok_or_else(|| anyhow!("data URI is not base64 encoded"))?,
        None => value,
    };
    BASE64_STANDARD
        .decode(payload.trim())
        .context("invalid base64 image data")
}

/// Decode JPEG or PNG bytes into an RGB bitmap.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(bytes).context("failed to decode image")?;
    Ok(image.to_rgb8())
}
