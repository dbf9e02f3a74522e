use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PortError {
    #[error("Could not find available port after {tries} attempts starting at {start}")]
    Exhausted { start: u16, tries: u16 },
    #[error("failed to publish port to {path}: {source}")]
    Publish { path: PathBuf, source: io::Error },
}

/// Bind the first free port at or after `start` on all interfaces.
///
/// The bound listener is returned so nothing can grab the port before the server uses it.
pub fn find_available_port(start: u16, tries: u16) -> Result<(TcpListener, u16), PortError> {
    let end = (start as u32 + tries as u32).min(u16::MAX as u32 + 1);

    for port in start as u32..end {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port as u16);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                info!("Bound port {}", port);
                return Ok((listener, port as u16));
            }
            Err(e) => debug!("Port {} unavailable: {}", port, e),
        }
    }

    Err(PortError::Exhausted { start, tries })
}

/// Write the chosen port where the tray and QR helpers look for it
pub fn publish_port(path: &Path, port: u16) -> Result<(), PortError> {
    fs::write(path, port.to_string()).map_err(|source| PortError::Publish {
        path: path.to_path_buf(),
        source,
    })
}

/// Address other devices on the LAN can reach us at. No packet is sent.
pub fn local_ip() -> IpAddr {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
