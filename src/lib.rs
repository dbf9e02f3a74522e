pub mod capture;
pub mod pipeline;
pub mod server;
pub mod sink;
pub mod tls;
pub mod utils;

use std::path::{Component, Path, PathBuf};

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::{DecodeError, Frame, FrameDecoder};
pub use pipeline::{FrameBuffer, Publisher, PublisherState, PublisherStatus};
pub use sink::{BackendKind, SinkError, VirtualCameraSink};

/// Environment prefix for configuration overrides, e.g. `PHONECAM__CAMERA__FPS=60`
pub const ENV_PREFIX: &str = "PHONECAM";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub decoder: DecoderConfig,
    pub camera: CameraConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub start_port: u16,
    pub port_tries: u16,
    /// Where the chosen port is written for the tray and QR helpers
    pub port_file: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Document root for `GET /<path>`; must not contain the key, certificate or port file
    pub static_root: PathBuf,
    /// Transport-level cap; frame-size policy lives in the decoder
    pub max_body_bytes: usize,
    /// Answer 500 to uploads while the virtual camera is failing
    pub surface_device_errors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub max_frame_bytes: usize,
    /// Largest width or height a frame may declare, checked before pixels are allocated
    pub max_dimension: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Tried in order, first one that opens wins
    pub backends: Vec<BackendKind>,
    pub fps: u32,
    /// Explicit output node, otherwise the first loopback device found
    pub device: Option<PathBuf>,
    pub output_format: PixelFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            start_port: 5000,
            port_tries: 100,
            port_file: PathBuf::from("server_port.txt"),
            cert_path: PathBuf::from("cert.pem"),
            key_path: PathBuf::from("key.pem"),
            static_root: PathBuf::from("static"),
            max_body_bytes: 8 * 1024 * 1024,
            surface_device_errors: true,
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1024 * 1024,
            max_dimension: 4096,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backends: vec![BackendKind::V4l2Loopback],
            fps: 30,
            device: None,
            // Most consumers (browsers included) refuse RGB3 on a loopback node
            output_format: PixelFormat::Yuyv,
        }
    }
}

impl ServerConfig {
    /// Refuse a static root that would publish the key, certificate, port file or `config_file`
    pub fn check_static_root(
        &self,
        config_file: Option<&Path>,
    ) -> Result<(), config::ConfigError> {
        let root = absolute(&self.static_root);
        let private = [
            Some(self.key_path.as_path()),
            Some(self.cert_path.as_path()),
            Some(self.port_file.as_path()),
            config_file,
        ];

        for path in private.into_iter().flatten() {
            if absolute(path).starts_with(&root) {
                return Err(config::ConfigError::Message(format!(
                    "server.static_root {:?} would serve {:?}; point it at a dedicated directory",
                    self.static_root, path
                )));
            }
        }
        Ok(())
    }
}

/// Lexically normalised absolute path. Nothing is resolved on disk, the files may not exist yet.
fn absolute(path: &Path) -> PathBuf {
    let joined = match std::env::current_dir() {
        Ok(cwd) if path.is_relative() => cwd.join(path),
        _ => path.to_path_buf(),
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

impl Config {
    /// Layer an optional TOML file and `PHONECAM__*` environment overrides over the defaults
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("camera.backends")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
