//! Pipeline Integration Tests
//!
//! Upload through the router, publish through the null backend, shut down in order.


use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use ingest_test_utils::*;
use phonecam::capture::{FrameDecoder, PixelFormat};
use phonecam::server::{self, AppState};
use phonecam::{
    BackendKind, CameraConfig, FrameBuffer, Publisher, PublisherState, PublisherStatus,
    VirtualCameraSink,
};

fn null_camera() -> CameraConfig {
    CameraConfig {
        backends: vec![BackendKind::Null],
        fps: 60,
        device: None,
        output_format: PixelFormat::Yuyv,
    }
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[tokio::test]
async fn test_upload_reaches_virtual_camera() {
    let root = tempfile::tempdir().unwrap();
    let config = server_config(root.path());

    let buffer = Arc::new(FrameBuffer::new());
    let publisher = Publisher::new(VirtualCameraSink::from_config(&null_camera()), 60);
    let status = publisher.status();
    assert_eq!(status.get(), PublisherState::Idle);

    let consumer = {
        let buffer = buffer.clone();
        thread::spawn(move || publisher.run(buffer))
    };

    let decoder = Arc::new(FrameDecoder::new(&Default::default()));
    let app = server::router(
        AppState::new(decoder, buffer.clone(), status.clone(), &config),
        &config,
    );

    let response = send(&app, upload_request(jpeg_frame(320, 240))).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(wait_until(|| status.get() == PublisherState::Active));

    // resolution change: the session is re-created at the new geometry
    let response = send(&app, upload_request(jpeg_frame(640, 480))).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(wait_until(|| buffer.stats().1 == 2));
    assert!(wait_until(|| status.get() == PublisherState::Active));

    buffer.close();
    consumer.join().unwrap();
    assert_eq!(status.get(), PublisherState::Idle);

    assert_eq!(buffer.stats(), (2, 2, 0));
}

#[tokio::test]
async fn test_uploads_after_close_are_ignored() {
    let root = tempfile::tempdir().unwrap();
    let h = harness(&server_config(root.path()), PublisherStatus::new());

    h.buffer.close();
    let response = send(&h.app, upload_request(jpeg_frame(64, 48))).await;
    // decode still succeeds; the frame just has nowhere to go
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(h.buffer.try_take().is_none());
}
