use tracing::info;

use super::{CameraBackend, CameraSession, FramePacer, Result};
use crate::capture::PixelFormat;

/// Discards frames at the configured pace. For headless hosts and containers.
pub struct NullBackend {
    format: PixelFormat,
}

impl NullBackend {
    pub fn new(format: PixelFormat) -> Self {
        Self { format }
    }
}

impl CameraBackend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn open(&self, width: u32, height: u32, fps: u32) -> Result<Box<dyn CameraSession>> {
        Ok(Box::new(NullSession {
            width,
            height,
            fps,
            format: self.format,
            pacer: FramePacer::new(fps),
            frames_sent: 0,
            open: true,
        }))
    }
}

struct NullSession {
    width: u32,
    height: u32,
    fps: u32,
    format: PixelFormat,
    pacer: FramePacer,
    frames_sent: u64,
    open: bool,
}

impl CameraSession for NullSession {
    fn backend(&self) -> &'static str {
        "null"
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn fps(&self) -> u32 {
        self.fps
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn send(&mut self, _pixels: &[u8]) -> Result<()> {
        self.frames_sent += 1;
        Ok(())
    }

    fn sleep_until_next_frame(&mut self) {
        self.pacer.sleep_until_next_frame();
    }

    fn close(&mut self) {
        if self.open {
            info!("Closing null camera (discarded {} frames)", self.frames_sent);
            self.open = false;
        }
    }
}
