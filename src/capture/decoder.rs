//! Upload validation and image decoding

use std::borrow::Cow;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use flate2::read::GzDecoder;
use thiserror::Error;
use tracing::{debug, instrument};

use super::frame::{Frame, PixelFormat};
use crate::DecoderConfig;

/// Client input errors, each mapped to a 4xx reply by the endpoint
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("No image data")]
    NoData,
    #[error("Invalid compressed data")]
    InvalidCompressed,
    #[error("Frame too large")]
    TooLarge { size: usize, limit: usize },
    #[error("Empty image buffer")]
    EmptyBuffer,
    #[error("Failed to decode image")]
    DecodeFailed(String),
}

impl DecodeError {
    /// HTTP status the endpoint replies with
    pub fn status(&self) -> u16 {
        match self {
            DecodeError::TooLarge { .. } => 413,
            _ => 400,
        }
    }

    /// Short machine-readable reason sent as the response body
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::NoData => "No image data",
            DecodeError::InvalidCompressed => "Invalid compressed data",
            DecodeError::TooLarge { .. } => "Frame too large",
            DecodeError::EmptyBuffer => "Empty image buffer",
            DecodeError::DecodeFailed(_) => "Failed to decode image",
        }
    }
}

/// Turns uploaded bytes into RGB frames.
///
/// Accepts any codec the `image` crate was built with (JPEG, PNG and WebP here),
/// guessing the format from the content rather than trusting the client.
pub struct FrameDecoder {
    max_frame_bytes: usize,
    max_dimension: u32,
    sequence: AtomicU64,
}

impl FrameDecoder {
    pub fn new(config: &DecoderConfig) -> Self {
        Self {
            max_frame_bytes: config.max_frame_bytes,
            max_dimension: config.max_dimension,
            sequence: AtomicU64::new(0),
        }
    }

    #[instrument(level = "debug", skip(self, data), fields(len = data.len()))]
    pub fn decode(&self, data: &[u8], compressed: bool) -> Result<Frame, DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::NoData);
        }

        let payload: Cow<'_, [u8]> = if compressed {
            Cow::Owned(gunzip(data, self.max_frame_bytes)?)
        } else {
            Cow::Borrowed(data)
        };

        if payload.len() > self.max_frame_bytes {
            return Err(DecodeError::TooLarge {
                size: payload.len(),
                limit: self.max_frame_bytes,
            });
        }

        if payload.is_empty() {
            return Err(DecodeError::EmptyBuffer);
        }

        let image = self
            .decode_image(&payload)
            .map_err(|e| DecodeError::DecodeFailed(e.to_string()))?
            .into_rgb8();

        let (width, height) = image.dimensions();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(sequence, width, height, "Decoded frame");

        Ok(Frame::new(
            Bytes::from(image.into_raw()),
            sequence,
            width,
            height,
            PixelFormat::Rgb24,
        ))
    }
}

impl FrameDecoder {
    // dimensions are checked from the header, before any pixel buffer is allocated
    fn decode_image(&self, payload: &[u8]) -> image::ImageResult<image::DynamicImage> {
        let mut limits = image::Limits::default();
        limits.max_image_width = Some(self.max_dimension);
        limits.max_image_height = Some(self.max_dimension);

        let mut reader = image::ImageReader::new(Cursor::new(payload)).with_guessed_format()?;
        reader.limits(limits);
        reader.decode()
    }
}

/// Inflate at most `limit + 1` bytes so an oversized stream is detected without
/// buffering all of it
fn gunzip(data: &[u8], limit: usize) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|_| DecodeError::InvalidCompressed)?;
    Ok(out)
}
