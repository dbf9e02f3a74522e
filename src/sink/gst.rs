//! GStreamer-based output: `appsrc ! videoconvert ! v4l2sink`

use std::path::PathBuf;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::info;

use super::{CameraBackend, CameraSession, FramePacer, Result, SinkError};
use crate::capture::PixelFormat;

const DEFAULT_DEVICE: &str = "/dev/video10";

pub struct GstBackend {
    device: Option<PathBuf>,
    format: PixelFormat,
}

impl GstBackend {
    pub fn new(device: Option<PathBuf>, format: PixelFormat) -> Self {
        Self { device, format }
    }

    fn build_pipeline_string(device: &str) -> String {
        // videoconvert lets the sink negotiate whatever the loopback consumer wants
        format!(
            "appsrc name=src is-live=true format=time do-timestamp=true ! \
             queue max-size-buffers=2 leaky=downstream ! \
             videoconvert ! \
             v4l2sink device={} sync=false",
            device
        )
    }
}

fn video_format(format: PixelFormat) -> gst_video::VideoFormat {
    match format {
        PixelFormat::Rgb24 => gst_video::VideoFormat::Rgb,
        PixelFormat::Bgr24 => gst_video::VideoFormat::Bgr,
        PixelFormat::Yuyv => gst_video::VideoFormat::Yuy2,
    }
}

impl CameraBackend for GstBackend {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn open(&self, width: u32, height: u32, fps: u32) -> Result<Box<dyn CameraSession>> {
        gst::init().map_err(|e| SinkError::Open(format!("Failed to initialize GStreamer: {}", e)))?;

        let device = self
            .device
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| DEFAULT_DEVICE.to_string());

        let pipeline_str = Self::build_pipeline_string(&device);
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| SinkError::Open(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| SinkError::Open("Failed to create pipeline".into()))?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| SinkError::Open("Failed to find appsrc element".into()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| SinkError::Open("Failed to cast to AppSrc".into()))?;

        let caps = gst_video::VideoInfo::builder(video_format(self.format), width, height)
            .fps(gst::Fraction::new(fps as i32, 1))
            .build()
            .and_then(|info| info.to_caps())
            .map_err(|e| SinkError::Open(format!("Invalid caps: {}", e)))?;
        appsrc.set_caps(Some(&caps));

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(SinkError::Open(format!("{}: {}", device, e)));
        }

        Ok(Box::new(GstSession {
            pipeline,
            appsrc,
            width,
            height,
            fps,
            format: self.format,
            pacer: FramePacer::new(fps),
            open: true,
        }))
    }
}

struct GstSession {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    width: u32,
    height: u32,
    fps: u32,
    format: PixelFormat,
    pacer: FramePacer,
    open: bool,
}

impl CameraSession for GstSession {
    fn backend(&self) -> &'static str {
        "gstreamer"
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
        let buffer = gst::Buffer::from_mut_slice(pixels.to_vec());
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| SinkError::Write(format!("{:?}", e)))?;
        Ok(())
    }

    fn sleep_until_next_frame(&mut self) {
        self.pacer.sleep_until_next_frame();
    }

    fn close(&mut self) {
        if self.open {
            info!("Stopping GStreamer output pipeline");
            let _ = self.appsrc.end_of_stream();
            let _ = self.pipeline.set_state(gst::State::Null);
            self.open = false;
        }
    }
}

impl Drop for GstSession {
    fn drop(&mut self) {
        self.close();
    }
}
