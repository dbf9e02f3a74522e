//! phonecam: phone camera frames over HTTPS, republished as a virtual webcam

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use tracing::{info, warn};

use phonecam::server::{self, AppState};
use phonecam::{
    tls, utils, BackendKind, Config, FrameBuffer, FrameDecoder, Publisher, VirtualCameraSink,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "phonecam", version, about)]
struct Args {
    /// TOML configuration file, missing is fine
    #[arg(short, long, default_value = "phonecam.toml")]
    config: PathBuf,

    /// First port to try
    #[arg(short, long)]
    port: Option<u16>,

    /// Output backend, may be repeated to set the fallback order
    #[arg(short, long, value_parser = parse_backend)]
    backend: Vec<BackendKind>,

    /// Output device node, e.g. /dev/video10
    #[arg(short, long)]
    device: Option<PathBuf>,
}

fn parse_backend(s: &str) -> Result<BackendKind, String> {
    match s.to_ascii_lowercase().as_str() {
        "v4l2loopback" | "v4l2" => Ok(BackendKind::V4l2Loopback),
        "gstreamer" | "gst" => Ok(BackendKind::Gstreamer),
        "null" => Ok(BackendKind::Null),
        other => Err(format!("unknown backend '{}'", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "phonecam=info".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();

    let mut config = Config::load(Some(args.config.as_path()))
        .wrap_err_with(|| format!("Failed to load configuration from {:?}", args.config))?;
    if let Some(port) = args.port {
        config.server.start_port = port;
    }
    if !args.backend.is_empty() {
        config.camera.backends = args.backend;
    }
    if args.device.is_some() {
        config.camera.device = args.device;
    }
    config
        .server
        .check_static_root(Some(args.config.as_path()))
        .wrap_err("Refusing to start")?;

    info!("phonecam launching...");

    let cert = tls::ensure_certificate_pair(&config.server.cert_path, &config.server.key_path)
        .wrap_err("Failed to provision TLS certificate")?;
    let tls_config = tls::server_config(&cert.cert_path, &cert.key_path)
        .wrap_err("Failed to build TLS configuration")?;

    let (listener, port) =
        utils::find_available_port(config.server.start_port, config.server.port_tries)?;
    if let Err(e) = utils::publish_port(&config.server.port_file, port) {
        // the server still works, only the helpers lose track of it
        warn!("{}", e);
    }

    // Publisher
    let buffer = Arc::new(FrameBuffer::new());
    let sink = VirtualCameraSink::from_config(&config.camera);
    info!("Virtual camera backends: {:?}", sink.backend_names());
    let publisher = Publisher::new(sink, config.camera.fps);
    let status = publisher.status();

    let publisher_buffer = buffer.clone();
    let publisher_handle = tokio::task::spawn_blocking(move || publisher.run(publisher_buffer));

    // Ingest endpoint
    let decoder = Arc::new(FrameDecoder::new(&config.decoder));
    let state = AppState::new(decoder, buffer.clone(), status, &config.server);
    let app = server::router(state, &config.server);

    info!("Local:   https://localhost:{}/", port);
    info!("Network: https://{}:{}/", utils::local_ip(), port);
    info!("Certificate fingerprint: {}", cert.fingerprint);

    let handle = axum_server::Handle::new();
    tokio::spawn(shutdown_on_signal(handle.clone()));

    let served = server::serve(listener, tls_config, app, handle).await;

    info!("Stopping publisher");
    buffer.close();
    if let Err(e) = publisher_handle.await {
        warn!("Publisher task ended abnormally: {}", e);
    }

    served.wrap_err("HTTPS server failed")?;

    info!("phonecam shutting down");
    Ok(())
}

async fn shutdown_on_signal(handle: axum_server::Handle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown requested");
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}
