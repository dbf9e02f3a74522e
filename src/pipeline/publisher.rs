//! Background task feeding the virtual camera

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, instrument, warn};

use super::FrameBuffer;
use crate::sink::{CameraSession, VirtualCameraSink};
use crate::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PublisherState {
    /// No session open
    Idle = 0,
    /// Session open at the geometry of the last published frame
    Active = 1,
    /// Last configure or publish failed; the next frame retries
    Recovering = 2,
}

impl PublisherState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PublisherState::Active,
            2 => PublisherState::Recovering,
            _ => PublisherState::Idle,
        }
    }
}

/// Read-only view of the publisher state, shareable with request handlers
#[derive(Debug, Clone, Default)]
pub struct PublisherStatus(Arc<AtomicU8>);

impl PublisherStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> PublisherState {
        PublisherState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: PublisherState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Owns the camera session. Only this type ever touches it, one frame at a time.
pub struct Publisher {
    sink: VirtualCameraSink,
    fps: u32,
    session: Option<Box<dyn CameraSession>>,
    status: PublisherStatus,
}

impl Publisher {
    pub fn new(sink: VirtualCameraSink, fps: u32) -> Self {
        Self {
            sink,
            fps,
            session: None,
            status: PublisherStatus::new(),
        }
    }

    pub fn status(&self) -> PublisherStatus {
        self.status.clone()
    }

    pub fn state(&self) -> PublisherState {
        self.status.get()
    }

    /// Geometry of the open session, if any
    pub fn session_geometry(&self) -> Option<(u32, u32)> {
        self.session.as_ref().map(|s| s.geometry())
    }

    /// Wait for frames until the buffer is closed, then release the device
    pub fn run(mut self, buffer: Arc<FrameBuffer>) {
        info!(
            "Publisher started (backends: {:?}, {} fps)",
            self.sink.backend_names(),
            self.fps
        );

        while let Some(frame) = buffer.take_blocking() {
            self.handle_frame(&frame);
        }

        self.shutdown();
        let (written, read, dropped) = buffer.stats();
        info!(
            "Publisher stopped ({} frames received, {} taken, {} superseded)",
            written, read, dropped
        );
    }

    /// Drive one state transition for `frame`
    #[instrument(level = "debug", skip(self, frame), fields(seq = frame.meta.sequence))]
    pub fn handle_frame(&mut self, frame: &Frame) -> PublisherState {
        let (width, height) = frame.geometry();

        if let Some(current) = self.session_geometry() {
            if current != (width, height) {
                info!(
                    "Resolution changed {}x{} -> {}x{}, re-creating virtual camera",
                    current.0, current.1, width, height
                );
                self.close_session();
                self.status.set(PublisherState::Idle);
            }
        }

        if self.session.is_none() {
            match self.sink.configure(width, height, self.fps) {
                Ok(session) => {
                    self.session = Some(session);
                    self.status.set(PublisherState::Active);
                }
                Err(e) => {
                    metrics::counter!("camera_configure_failures").increment(1);
                    warn!("Virtual camera unavailable, dropping frame: {}", e);
                    self.status.set(PublisherState::Recovering);
                    return PublisherState::Recovering;
                }
            }
        }

        let Some(session) = self.session.as_mut() else {
            return self.state();
        };

        let Some(converted) = frame.convert(session.format()) else {
            warn!(
                "Cannot convert {:?} to {:?}, dropping frame",
                frame.format(),
                session.format()
            );
            return self.state();
        };

        let start = Instant::now();
        match self.sink.publish(session.as_mut(), &converted.data) {
            Ok(()) => {
                metrics::counter!("frames_published").increment(1);
                metrics::histogram!("publish_time_us").record(start.elapsed().as_micros() as f64);
                metrics::histogram!("frame_latency_ms")
                    .record(frame.timestamp.elapsed().as_millis() as f64);
                self.status.set(PublisherState::Active);
            }
            Err(e) => {
                metrics::counter!("publish_failures").increment(1);
                error!("Virtual camera publish failed: {}", e);
                // the backend may already be broken; close anyway and forget it
                self.close_session();
                self.status.set(PublisherState::Recovering);
            }
        }

        self.state()
    }

    /// Close any open session. Called on exit.
    pub fn shutdown(&mut self) {
        if self.session.is_some() {
            info!("Releasing virtual camera");
        }
        self.close_session();
        self.status.set(PublisherState::Idle);
    }

    fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            self.sink.close(session.as_mut());
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.close_session();
    }
}
