//! Certificate bootstrap and rustls server configuration
//!
//! Phones only expose the camera to pages served over HTTPS, so the listener needs a
//! certificate before it can bind. A self-signed pair is generated once and reused
//! until it expires:
//!
//! - **Algorithm**: RSA 2048-bit, SHA-256 signature
//! - **Subject**: CN=localhost, SAN=localhost
//! - **Validity**: 1 year

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rsa::{pkcs8::EncodePrivateKey, RsaPrivateKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

const CERT_VALIDITY_DAYS: u64 = 365;
const CERT_COMMON_NAME: &str = "localhost";
const CERT_ORG: &str = "phonecam";

pub type Result<T, E = TlsError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("TLS configuration error: {0}")]
    Config(String),
}

/// A certificate/key pair on disk
#[derive(Debug, Clone)]
pub struct CertificatePair {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// SHA-256 of the DER certificate, colon-separated hex
    pub fingerprint: String,
    /// False when an existing valid pair was reused
    pub generated: bool,
}

/// Reuse the pair at `cert_path`/`key_path` if it is readable, in its validity window and
/// the key matches the certificate, otherwise generate a fresh one there
pub fn ensure_certificate_pair(cert_path: &Path, key_path: &Path) -> Result<CertificatePair> {
    if cert_path.exists() && key_path.exists() {
        let usable = load_pair(cert_path, key_path)
            .and_then(|(cert, key)| build_server_config(cert.clone(), key).map(|_| cert));
        match usable {
            Ok(cert) => {
                let fingerprint = fingerprint(&cert);
                debug!("Reusing certificate {:?} ({})", cert_path, fingerprint);
                return Ok(CertificatePair {
                    cert_path: cert_path.to_path_buf(),
                    key_path: key_path.to_path_buf(),
                    fingerprint,
                    generated: false,
                });
            }
            Err(e) => warn!("Existing certificate unusable, regenerating: {}", e),
        }
    }

    info!("Generating self-signed certificate for {}", CERT_COMMON_NAME);
    let (cert, key) = generate_self_signed()?;
    write_pem(cert_path, "CERTIFICATE", &cert)?;
    write_pem(key_path, "PRIVATE KEY", &key)?;

    let fingerprint = fingerprint(&cert);
    info!(
        "Saved certificate to {:?} and private key to {:?} ({})",
        cert_path, key_path, fingerprint
    );

    Ok(CertificatePair {
        cert_path: cert_path.to_path_buf(),
        key_path: key_path.to_path_buf(),
        fingerprint,
        generated: true,
    })
}

/// DER certificate and PKCS#8 DER key
pub fn generate_self_signed() -> Result<(Vec<u8>, Vec<u8>)> {
    // rcgen 0.12 can't generate RSA keys itself
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 2048)
        .map_err(|e| TlsError::Certificate(format!("Failed to generate RSA key: {}", e)))?;
    let private_key_der = private_key
        .to_pkcs8_der()
        .map_err(|e| TlsError::Certificate(format!("Failed to encode private key: {}", e)))?;
    let key_pair = KeyPair::from_der(private_key_der.as_bytes())
        .map_err(|e| TlsError::Certificate(format!("Failed to import key pair: {}", e)))?;

    let mut params = CertificateParams::new(vec![CERT_COMMON_NAME.to_string()]);
    params.alg = &rcgen::PKCS_RSA_SHA256;
    params.key_pair = Some(key_pair);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, CERT_ORG);
    dn.push(DnType::CommonName, CERT_COMMON_NAME);
    params.distinguished_name = dn;

    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + Duration::from_secs(CERT_VALIDITY_DAYS * 24 * 60 * 60);
    params.is_ca = rcgen::IsCa::NoCa;

    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| TlsError::Certificate(format!("Failed to create certificate: {}", e)))?;
    let cert_der = cert
        .serialize_der()
        .map_err(|e| TlsError::Certificate(format!("Failed to serialize certificate: {}", e)))?;

    Ok((cert_der, cert.serialize_private_key_der()))
}

/// rustls server configuration for the pair on disk
pub fn server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let (cert, key) = load_pair(cert_path, key_path)?;
    build_server_config(cert, key)
}

// with_single_cert rejects a key that does not belong to the certificate
fn build_server_config(
    cert: Vec<u8>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<rustls::ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Config(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(vec![CertificateDer::from(cert)], key)
        .map_err(|e| TlsError::Config(e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

pub fn fingerprint(cert_der: &[u8]) -> String {
    Sha256::digest(cert_der)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse both PEM files and check the certificate is currently valid
fn load_pair(cert_path: &Path, key_path: &Path) -> Result<(Vec<u8>, PrivateKeyDer<'static>)> {
    let cert_pem = read_pem(cert_path)?;
    if cert_pem.tag() != "CERTIFICATE" {
        return Err(TlsError::Certificate(format!(
            "Expected CERTIFICATE tag, got {}",
            cert_pem.tag()
        )));
    }
    let cert = cert_pem.into_contents();

    let (_, parsed) = x509_parser::parse_x509_certificate(&cert)
        .map_err(|e| TlsError::Certificate(format!("Failed to parse certificate: {}", e)))?;
    if !parsed.validity().is_valid() {
        return Err(TlsError::Certificate(
            "Certificate is expired or not yet valid".into(),
        ));
    }

    let key_pem = read_pem(key_path)?;
    let tag = key_pem.tag().to_string();
    let contents = key_pem.into_contents();
    let key = match tag.as_str() {
        "PRIVATE KEY" => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(contents)),
        "RSA PRIVATE KEY" => PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(contents)),
        other => {
            return Err(TlsError::Certificate(format!(
                "Expected PRIVATE KEY or RSA PRIVATE KEY tag, got {}",
                other
            )))
        }
    };

    Ok((cert, key))
}

fn read_pem(path: &Path) -> Result<pem::Pem> {
    let data = fs::read(path).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    pem::parse(&data).map_err(|e| TlsError::Certificate(format!("{}: {}", path.display(), e)))
}

fn write_pem(path: &Path, tag: &str, der: &[u8]) -> Result<()> {
    let io_err = |source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let encoded = pem::encode(&pem::Pem::new(tag, der.to_vec()));
    fs::write(path, encoded).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::*;

    #[test]
    fn generates_then_reuses_pair() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("certs/cert.pem");
        let key = dir.path().join("certs/key.pem");

        let first = ensure_certificate_pair(&cert, &key).unwrap();
        assert!(first.generated);
        assert!(cert.exists() && key.exists());

        let second = ensure_certificate_pair(&cert, &key).unwrap();
        assert!(!second.generated);
        assert_eq!(first.fingerprint, second.fingerprint);

        // the pair is usable by rustls
        server_config(&cert, &key).unwrap();

        let der = read_pem(&cert).unwrap().into_contents();
        let (_, parsed) = X509Certificate::from_der(&der).unwrap();
        let cn = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok());
        assert_eq!(cn, Some("localhost"));

        let validity = parsed.validity();
        let days = (validity.not_after.timestamp() - validity.not_before.timestamp()) / 86_400;
        assert_eq!(days, 365);
    }

    #[test]
    fn corrupt_pair_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        fs::write(&cert, "not a certificate").unwrap();
        fs::write(&key, "not a key").unwrap();

        let pair = ensure_certificate_pair(&cert, &key).unwrap();
        assert!(pair.generated);
        assert!(load_pair(&cert, &key).is_ok());
    }

    #[test]
    fn foreign_key_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        let other_cert = dir.path().join("other/cert.pem");
        let other_key = dir.path().join("other/key.pem");

        let original = ensure_certificate_pair(&cert, &key).unwrap();
        ensure_certificate_pair(&other_cert, &other_key).unwrap();
        // stale key from another run next to a still-valid certificate
        fs::copy(&other_key, &key).unwrap();
        assert!(server_config(&cert, &key).is_err());

        let pair = ensure_certificate_pair(&cert, &key).unwrap();
        assert!(pair.generated);
        assert_ne!(pair.fingerprint, original.fingerprint);
        server_config(&cert, &key).unwrap();
    }

    #[test]
    fn missing_files_fail_server_config() {
        let dir = tempfile::tempdir().unwrap();
        let err = server_config(&dir.path().join("cert.pem"), &dir.path().join("key.pem"))
            .unwrap_err();
        assert!(matches!(err, TlsError::Io { .. }));
    }

    #[test]
    fn fingerprint_format() {
        let fp = fingerprint(b"abc");
        assert_eq!(fp.len(), 32 * 3 - 1);
        assert!(fp.starts_with("BA:78:16:BF"));
    }
}
