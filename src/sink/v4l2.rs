//! v4l2loopback output
//!
//! Needs the `v4l2loopback` kernel module:
//!
//! ```bash
//! sudo modprobe v4l2loopback devices=1 video_nr=10 card_label="Phone Camera" exclusive_caps=1
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use v4l::capability::Flags;
use v4l::video::Output;
use v4l::{Device, FourCC};

use super::{CameraBackend, CameraSession, FramePacer, Result, SinkError};
use crate::capture::PixelFormat;

pub struct V4l2LoopbackBackend {
    /// Explicit device, otherwise the first loopback node found under /dev
    device: Option<PathBuf>,
    format: PixelFormat,
}

impl V4l2LoopbackBackend {
    pub fn new(device: Option<PathBuf>, format: PixelFormat) -> Self {
        Self { device, format }
    }

    fn resolve_device(&self) -> Result<PathBuf> {
        if let Some(path) = &self.device {
            return Ok(path.clone());
        }
        find_loopback_devices().into_iter().next().ok_or_else(|| {
            SinkError::DeviceNotFound(
                "no v4l2loopback device, load it with `modprobe v4l2loopback`".into(),
            )
        })
    }
}

impl CameraBackend for V4l2LoopbackBackend {
    fn name(&self) -> &'static str {
        "v4l2loopback"
    }

    fn open(&self, width: u32, height: u32, fps: u32) -> Result<Box<dyn CameraSession>> {
        let path = self.resolve_device()?;
        info!(
            "Opening v4l2loopback device {} ({}x{}, {:?})",
            path.display(),
            width,
            height,
            self.format
        );

        if !path.exists() {
            return Err(SinkError::DeviceNotFound(path.display().to_string()));
        }

        let device = Device::with_path(&path).map_err(|e| open_error(&path, e))?;

        let mut fmt = v4l::Format::new(width, height, FourCC::new(&self.format.fourcc()));
        fmt.stride = self.format.bytes_per_line(width);
        fmt.size = self.format.frame_size(width, height) as u32;

        // v4l2loopback often refuses S_FMT while a reader holds the node but still accepts writes
        match Output::set_format(&device, &fmt) {
            Ok(actual) if actual.width != width || actual.height != height => {
                return Err(SinkError::Open(format!(
                    "device kept {}x{}, wanted {}x{}",
                    actual.width, actual.height, width, height
                )));
            }
            Ok(_) => debug!("Set v4l2 format {}x{} {}", width, height, fmt.fourcc),
            Err(e) => warn!("Could not set v4l2 format (may still work): {}", e),
        }

        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| open_error(&path, e))?;

        Ok(Box::new(V4l2Session {
            path,
            _device: device,
            file: Some(file),
            width,
            height,
            fps,
            format: self.format,
            pacer: FramePacer::new(fps),
            frames_written: 0,
        }))
    }
}

fn open_error(path: &Path, e: io::Error) -> SinkError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => SinkError::PermissionDenied(path.display().to_string()),
        io::ErrorKind::NotFound => SinkError::DeviceNotFound(path.display().to_string()),
        _ => SinkError::Open(format!("{}: {}", path.display(), e)),
    }
}

struct V4l2Session {
    path: PathBuf,
    /// Held so the negotiated format stays in place while we write
    _device: Device,
    file: Option<File>,
    width: u32,
    height: u32,
    fps: u32,
    format: PixelFormat,
    pacer: FramePacer,
    frames_written: u64,
}

impl CameraSession for V4l2Session {
    fn backend(&self) -> &'static str {
        "v4l2loopback"
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

    fn send(&mut self, pixels: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| SinkError::Write("device closed".into()))?;

        file.write_all(pixels)
            .map_err(|e| SinkError::Write(format!("{}: {}", self.path.display(), e)))?;
        self.frames_written += 1;
        Ok(())
    }

    fn sleep_until_next_frame(&mut self) {
        self.pacer.sleep_until_next_frame();
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            info!(
                "Closing v4l2loopback device {} (wrote {} frames)",
                self.path.display(),
                self.frames_written
            );
        }
    }
}

impl Drop for V4l2Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Loopback output nodes on this machine, sorted by path
pub fn find_loopback_devices() -> Vec<PathBuf> {
    let mut devices: Vec<PathBuf> = std::fs::read_dir("/dev")
        .into_iter()
        .flatten()
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("video"))
        })
        .filter(|path| is_loopback_device(path))
        .collect();

    devices.sort();
    devices
}

fn is_loopback_device(path: &Path) -> bool {
    let Ok(device) = Device::with_path(path) else {
        return false;
    };
    let Ok(caps) = device.query_caps() else {
        return false;
    };
    caps.capabilities.contains(Flags::VIDEO_OUTPUT) && caps.driver.contains("v4l2 loopback")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_is_reported() {
        let backend = V4l2LoopbackBackend::new(
            Some(PathBuf::from("/dev/phonecam-does-not-exist")),
            PixelFormat::Yuyv,
        );
        let err = backend.open(640, 480, 30).err().unwrap();
        assert!(matches!(err, SinkError::DeviceNotFound(_)));
    }
}
