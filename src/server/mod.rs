//! HTTPS ingest endpoint
//!
//! - `POST /upload` takes one encoded frame per request (optionally `Content-Encoding: gzip`)
//! - `OPTIONS /upload` answers the CORS preflight
//! - `GET /` serves the capture page, anything else comes from the static root

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tower_http::services::ServeDir;
use tracing::{debug, error, info, warn};

use crate::pipeline::{FrameBuffer, PublisherState, PublisherStatus};
use crate::{FrameDecoder, ServerConfig};

/// Built-in capture page, used when the static root has no index.html
pub const LANDING_PAGE: &str = include_str!("../../assets/index.html");

pub const DEVICE_UNAVAILABLE: &str =
    "Virtual camera unavailable: load v4l2loopback (or configure another backend) and retry";

const ALLOW_ORIGIN: &str = "*";
const ALLOW_METHODS: &str = "POST, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, Content-Encoding";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    decoder: Arc<FrameDecoder>,
    buffer: Arc<FrameBuffer>,
    status: PublisherStatus,
    surface_device_errors: bool,
    static_root: PathBuf,
}

impl AppState {
    pub fn new(
        decoder: Arc<FrameDecoder>,
        buffer: Arc<FrameBuffer>,
        status: PublisherStatus,
        config: &ServerConfig,
    ) -> Self {
        Self {
            decoder,
            buffer,
            status,
            surface_device_errors: config.surface_device_errors,
            static_root: config.static_root.clone(),
        }
    }
}

pub fn router(state: AppState, config: &ServerConfig) -> Router {
    // ServeDir refuses paths that climb out of the root
    let assets = ServeDir::new(&config.static_root);

    Router::new()
        .route("/", get(index))
        .route("/upload", post(upload).options(preflight))
        .fallback_service(assets)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(middleware::map_response(add_cors_headers))
        .with_state(state)
}

/// Serve `app` over TLS on an already-bound listener until `handle` shuts it down
pub async fn serve(
    listener: std::net::TcpListener,
    tls: Arc<rustls::ServerConfig>,
    app: Router,
    handle: axum_server::Handle,
) -> io::Result<()> {
    listener.set_nonblocking(true)?;
    info!("Listening on https://{}", listener.local_addr()?);

    axum_server::from_tcp_rustls(listener, RustlsConfig::from_config(tls))
        .handle(handle)
        .serve(app.into_make_service())
        .await
}

async fn add_cors_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static(ALLOW_ORIGIN),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    response
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn index(State(state): State<AppState>) -> Response {
    let custom = state.static_root.join("index.html");
    match tokio::fs::read_to_string(&custom).await {
        Ok(page) => Html(page).into_response(),
        Err(_) => Html(LANDING_PAGE).into_response(),
    }
}

async fn upload(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let compressed = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"));

    metrics::counter!("frames_received").increment(1);

    let decoder = state.decoder.clone();
    let decoded = tokio::task::spawn_blocking(move || decoder.decode(&body, compressed)).await;

    let frame = match decoded {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => {
            metrics::counter!("frames_rejected").increment(1);
            debug!("Rejected upload: {:?}", e);
            let status = StatusCode::from_u16(e.status()).unwrap_or(StatusCode::BAD_REQUEST);
            return (status, e.reason()).into_response();
        }
        Err(e) => {
            error!("Decode task failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response();
        }
    };

    // stored first so the publisher's next configure attempt has something to show
    state.buffer.put(frame);

    if state.surface_device_errors && state.status.get() == PublisherState::Recovering {
        warn!("Upload accepted but virtual camera is failing");
        return (StatusCode::INTERNAL_SERVER_ERROR, DEVICE_UNAVAILABLE).into_response();
    }

    StatusCode::NO_CONTENT.into_response()
}
