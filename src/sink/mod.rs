//! Virtual camera output
//!
//! A [`VirtualCameraSink`] holds an ordered list of backends. `configure` opens the first
//! one that works at the requested geometry and hands back a [`CameraSession`]; the
//! publisher owns that session until the geometry changes or the device fails.

mod null;
pub use null::NullBackend;

#[cfg(feature = "v4l2loopback")]
mod v4l2;
#[cfg(feature = "v4l2loopback")]
pub use v4l2::{find_loopback_devices, V4l2LoopbackBackend};

#[cfg(feature = "gstreamer-pipeline")]
mod gst;
#[cfg(feature = "gstreamer-pipeline")]
pub use gst::GstBackend;

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::capture::PixelFormat;
use crate::CameraConfig;

pub type Result<T, E = SinkError> = core::result::Result<T, E>;

/// Device-side failures. Never reach the HTTP caller directly.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("virtual camera device not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied for {0}, try adding user to the 'video' group")]
    PermissionDenied(String),
    #[error("failed to open virtual camera: {0}")]
    Open(String),
    #[error("failed to write frame: {0}")]
    Write(String),
    #[error("frame is {got} bytes, session expects {expected}")]
    FrameSize { expected: usize, got: usize },
    #[error("backend not compiled in (enable the `{0}` feature)")]
    Disabled(&'static str),
    #[error("no virtual camera backend could be opened: {}", Attempts(.attempts))]
    NoBackend { attempts: Vec<(String, String)> },
}

struct Attempts<'a>(&'a [(String, String)]);

impl fmt::Display for Attempts<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("no backends configured");
        }
        for (i, (backend, reason)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{backend}: {reason}")?;
        }
        Ok(())
    }
}

/// Backend identifiers as they appear in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    V4l2Loopback,
    Gstreamer,
    Null,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::V4l2Loopback => "v4l2loopback",
            BackendKind::Gstreamer => "gstreamer",
            BackendKind::Null => "null",
        }
    }
}

/// A way of producing virtual camera sessions
pub trait CameraBackend: Send {
    fn name(&self) -> &'static str;

    /// Open the output device at the given geometry
    fn open(&self, width: u32, height: u32, fps: u32) -> Result<Box<dyn CameraSession>>;
}

/// An open virtual camera device
pub trait CameraSession: Send {
    fn backend(&self) -> &'static str;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn fps(&self) -> u32;

    /// Pixel layout `send` expects
    fn format(&self) -> PixelFormat;

    fn send(&mut self, pixels: &[u8]) -> Result<()>;

    /// Block until the next frame slot; backends without their own clock use [`FramePacer`]
    fn sleep_until_next_frame(&mut self);

    /// Release the device. Must be safe to call more than once.
    fn close(&mut self);

    fn geometry(&self) -> (u32, u32) {
        (self.width(), self.height())
    }
}

/// Stand-in for a backend that was configured but compiled out
#[allow(dead_code)]
struct DisabledBackend {
    name: &'static str,
    feature: &'static str,
}

impl CameraBackend for DisabledBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn open(&self, _width: u32, _height: u32, _fps: u32) -> Result<Box<dyn CameraSession>> {
        Err(SinkError::Disabled(self.feature))
    }
}

fn build_backend(kind: BackendKind, config: &CameraConfig) -> Box<dyn CameraBackend> {
    match kind {
        #[cfg(feature = "v4l2loopback")]
        BackendKind::V4l2Loopback => Box::new(V4l2LoopbackBackend::new(
            config.device.clone(),
            config.output_format,
        )),
        #[cfg(not(feature = "v4l2loopback"))]
        BackendKind::V4l2Loopback => Box::new(DisabledBackend {
            name: kind.as_str(),
            feature: "v4l2loopback",
        }),
        #[cfg(feature = "gstreamer-pipeline")]
        BackendKind::Gstreamer => Box::new(GstBackend::new(config.device.clone(), config.output_format)),
        #[cfg(not(feature = "gstreamer-pipeline"))]
        BackendKind::Gstreamer => Box::new(DisabledBackend {
            name: kind.as_str(),
            feature: "gstreamer-pipeline",
        }),
        BackendKind::Null => Box::new(NullBackend::new(config.output_format)),
    }
}

/// Ordered set of output backends
pub struct VirtualCameraSink {
    backends: Vec<Box<dyn CameraBackend>>,
}

impl VirtualCameraSink {
    pub fn new(backends: Vec<Box<dyn CameraBackend>>) -> Self {
        Self { backends }
    }

    pub fn from_config(config: &CameraConfig) -> Self {
        let backends = config
            .backends
            .iter()
            .map(|kind| build_backend(*kind, config))
            .collect();
        Self::new(backends)
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Try every backend in order; the first one that opens wins
    pub fn configure(&self, width: u32, height: u32, fps: u32) -> Result<Box<dyn CameraSession>> {
        let mut attempts = Vec::new();

        for backend in &self.backends {
            match backend.open(width, height, fps) {
                Ok(session) => {
                    info!(
                        "Virtual camera ready: {} ({}x{} @ {}fps, {:?})",
                        backend.name(),
                        width,
                        height,
                        fps,
                        session.format()
                    );
                    return Ok(session);
                }
                Err(e) => {
                    debug!("Backend {} failed: {}", backend.name(), e);
                    attempts.push((backend.name().to_string(), e.to_string()));
                }
            }
        }

        Err(SinkError::NoBackend { attempts })
    }

    /// Push one frame, then wait out the rest of the frame interval
    pub fn publish(&self, session: &mut dyn CameraSession, pixels: &[u8]) -> Result<()> {
        let expected = session
            .format()
            .frame_size(session.width(), session.height());
        if pixels.len() != expected {
            return Err(SinkError::FrameSize {
                expected,
                got: pixels.len(),
            });
        }

        session.send(pixels)?;
        session.sleep_until_next_frame();
        Ok(())
    }

    pub fn close(&self, session: &mut dyn CameraSession) {
        session.close();
    }
}

impl fmt::Debug for VirtualCameraSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualCameraSink")
            .field("backends", &self.backend_names())
            .finish()
    }
}

/// Fixed-rate frame clock. Falls back into step instead of bursting after a stall.
#[derive(Debug)]
pub struct FramePacer {
    interval: Duration,
    next: Option<Instant>,
}

impl FramePacer {
    pub fn new(fps: u32) -> Self {
        Self {
            interval: Duration::from_secs(1) / fps.max(1),
            next: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// How long to sleep at `now`, advancing the clock
    pub fn delay(&mut self, now: Instant) -> Option<Duration> {
        let target = self.next.unwrap_or(now + self.interval);
        if target > now {
            self.next = Some(target + self.interval);
            Some(target - now)
        } else {
            if now - target > self.interval {
                warn!("Virtual camera fell behind by {:?}", now - target);
            }
            self.next = Some(now + self.interval);
            None
        }
    }

    pub fn sleep_until_next_frame(&mut self) {
        if let Some(delay) = self.delay(Instant::now()) {
            std::thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingBackend(&'static str);

    impl CameraBackend for FailingBackend {
        fn name(&self) -> &'static str {
            self.0
        }

        fn open(&self, _w: u32, _h: u32, _fps: u32) -> Result<Box<dyn CameraSession>> {
            Err(SinkError::DeviceNotFound(format!("/dev/{}", self.0)))
        }
    }

    #[test]
    fn first_working_backend_wins() {
        let sink = VirtualCameraSink::new(vec![
            Box::new(FailingBackend("first")),
            Box::new(NullBackend::new(PixelFormat::Rgb24)),
            Box::new(FailingBackend("never-tried")),
        ]);

        let session = sink.configure(640, 480, 30).unwrap();
        assert_eq!(session.backend(), "null");
        assert_eq!(session.geometry(), (640, 480));
    }

    #[test]
    fn all_failures_are_collected_in_order() {
        let sink = VirtualCameraSink::new(vec![
            Box::new(FailingBackend("a")),
            Box::new(FailingBackend("b")),
        ]);

        let Err(SinkError::NoBackend { attempts }) = sink.configure(640, 480, 30) else {
            panic!("expected NoBackend");
        };
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].0, "a");
        assert_eq!(attempts[1].0, "b");
        assert!(attempts[1].1.contains("/dev/b"));
    }

    #[test]
    fn empty_backend_list_is_no_backend() {
        let err = VirtualCameraSink::new(Vec::new())
            .configure(640, 480, 30)
            .err()
            .unwrap();
        assert!(err.to_string().contains("no backends configured"));
    }

    #[test]
    fn publish_rejects_wrong_buffer_size() {
        let sink = VirtualCameraSink::new(vec![Box::new(NullBackend::new(PixelFormat::Yuyv))]);
        let mut session = sink.configure(4, 2, 1000).unwrap();

        let err = sink.publish(session.as_mut(), &[0; 24]).unwrap_err();
        assert!(matches!(err, SinkError::FrameSize { expected: 16, got: 24 }));
        sink.publish(session.as_mut(), &[0; 16]).unwrap();
    }

    #[test]
    fn close_is_idempotent() {
        let sink = VirtualCameraSink::new(vec![Box::new(NullBackend::new(PixelFormat::Rgb24))]);
        let mut session = sink.configure(2, 2, 30).unwrap();
        sink.close(session.as_mut());
        sink.close(session.as_mut());
    }

    #[test]
    fn config_order_is_kept() {
        let config = CameraConfig {
            backends: vec![BackendKind::Gstreamer, BackendKind::Null],
            ..CameraConfig::default()
        };
        let sink = VirtualCameraSink::from_config(&config);
        assert_eq!(sink.backend_names(), vec!["gstreamer", "null"]);
    }

    #[test]
    fn pacer_spaces_frames() {
        let mut pacer = FramePacer::new(10);
        let start = Instant::now();

        assert_eq!(pacer.delay(start), Some(Duration::from_millis(100)));
        // called right after the first sleep finished
        let after = start + Duration::from_millis(100);
        assert_eq!(pacer.delay(after), Some(Duration::from_millis(100)));
    }

    #[test]
    fn pacer_resyncs_when_late() {
        let mut pacer = FramePacer::new(10);
        let start = Instant::now();
        pacer.delay(start);

        let late = start + Duration::from_secs(2);
        assert_eq!(pacer.delay(late), None);
        assert_eq!(
            pacer.delay(late + Duration::from_millis(40)),
            Some(Duration::from_millis(60))
        );
    }
}
