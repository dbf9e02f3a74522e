use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Decoded frame - cheap to clone, never mutated after creation
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Receive timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Packed 8-bit pixel formats we move through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    /// YUV 4:2:2 packed, the most widely accepted loopback format
    Yuyv,
}

impl PixelFormat {
    /// Bytes needed for one frame at the given geometry
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => pixels * 3,
            PixelFormat::Yuyv => pixels * 2,
        }
    }

    pub fn bytes_per_line(&self, width: u32) -> u32 {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => width * 3,
            PixelFormat::Yuyv => width * 2,
        }
    }

    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Yuyv => *b"YUYV",
        }
    }
}

impl Frame {
    pub fn new(data: Bytes, sequence: u64, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data,
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                format,
            }),
            timestamp: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }

    pub fn geometry(&self) -> (u32, u32) {
        (self.meta.width, self.meta.height)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes() {
        assert_eq!(PixelFormat::Rgb24.frame_size(640, 480), 640 * 480 * 3);
        assert_eq!(PixelFormat::Yuyv.frame_size(1280, 720), 1280 * 720 * 2);
        assert_eq!(PixelFormat::Bgr24.bytes_per_line(1280), 3840);
    }
}
