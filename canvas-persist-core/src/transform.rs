/*!
Reference JPEG image transform.

Decodes a PNG or JPEG snapshot, bounds its largest side, and re-encodes it as
JPEG at the requested quality, keeping the payload's string representation
(data URI in, data URI out; bare base64 in, bare base64 out).
*/

use crate::compression::{ImageTransform, TransformRequest, TransformResponse};
use crate::{PersistError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

/// Largest width or height kept after downsampling
pub const MAX_DIMENSION: u32 = 2000;

const JPEG_DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

/// Lossy JPEG re-encoder
#[derive(Debug, Clone)]
pub struct JpegTransform {
    max_dimension: u32,
}

impl JpegTransform {
    pub fn new() -> Self {
        Self::with_max_dimension(MAX_DIMENSION)
    }

    pub fn with_max_dimension(max_dimension: u32) -> Self {
        Self {
            max_dimension: max_dimension.max(1),
        }
    }

    /// Re-encode `payload` at `quality`
    pub fn reencode(&self, payload: &str, quality: f32) -> Result<String> {
        let (is_data_uri, encoded) = split_payload(payload)?;
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| PersistError::compression(format!("invalid base64: {e}")))?;

        let image = image::load_from_memory(&bytes)
            .map_err(|e| PersistError::compression(format!("failed to decode image: {e}")))?;
        let rgb = self.downsample(image).to_rgb8();

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, jpeg_quality(quality))
            .encode_image(&rgb)
            .map_err(|e| PersistError::compression(format!("failed to encode JPEG: {e}")))?;

        let encoded = STANDARD.encode(&jpeg);
        Ok(if is_data_uri {
            format!("{JPEG_DATA_URI_PREFIX}{encoded}")
        } else {
            encoded
        })
    }

    /// Scale both sides by `max_dimension / max(width, height)` when either
    /// exceeds the bound
    fn downsample(&self, image: DynamicImage) -> DynamicImage {
        let (width, height) = (image.width(), image.height());
        match scaled_dimensions(width, height, self.max_dimension) {
            Some((w, h)) => image.resize_exact(w, h, FilterType::Triangle),
            None => image,
        }
    }
}

impl Default for JpegTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageTransform for JpegTransform {
    fn transform(&self, request: &TransformRequest) -> TransformResponse {
        match self.reencode(&request.payload, request.quality) {
            Ok(data) => TransformResponse::success(request.id, data),
            Err(e) => TransformResponse::failure(request.id, e.to_string()),
        }
    }

    fn name(&self) -> &str {
        "jpeg"
    }
}

/// Target size when `width x height` exceeds `max_dimension`
pub fn scaled_dimensions(width: u32, height: u32, max_dimension: u32) -> Option<(u32, u32)> {
    let largest = width.max(height);
    if largest <= max_dimension {
        return None;
    }
    let scale = f64::from(max_dimension) / f64::from(largest);
    let scale_side = |side: u32| ((f64::from(side) * scale).round() as u32).max(1);
    Some((scale_side(width), scale_side(height)))
}

fn jpeg_quality(quality: f32) -> u8 {
    (quality * 100.0).round().clamp(1.0, 100.0) as u8
}

/// Split a payload into (was a data URI, base64 body)
fn split_payload(payload: &str) -> Result<(bool, &str)> {
    let Some(rest) = payload.strip_prefix("data:") else {
        return Ok((false, payload));
    };
    let (header, body) = rest
        .split_once(',')
        .ok_or_else(|| PersistError::compression("data URI has no payload separator"))?;
    if !header.ends_with(";base64") {
        return Err(PersistError::compression(format!(
            "unsupported data URI encoding: {header}"
        )));
    }
    Ok((true, body))
}
