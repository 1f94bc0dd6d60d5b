//! TLS termination and ALPN negotiation.
//!
//! Certificates come from a [`CertificateProvider`]. Issuance and rotation
//! happen elsewhere; the gateway only consumes a ready credential.

use crate::error::{ProxyError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Supported HTTP protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpProtocol {
    Http1,
    Http2,
    /// Negotiate via ALPN, preferring HTTP/2.
    #[default]
    Auto,
}

impl HttpProtocol {
    /// Returns the ALPN protocol identifiers for this protocol.
    pub fn alpn_protocols(&self) -> Vec<Vec<u8>> {
        match self {
            HttpProtocol::Http1 => vec![b"http/1.1".to_vec()],
            HttpProtocol::Http2 => vec![b"h2".to_vec()],
            HttpProtocol::Auto => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
        }
    }

    /// Determines the protocol from the ALPN result, defaulting to HTTP/1.1.
    pub fn from_alpn(alpn: Option<&[u8]>) -> Self {
        match alpn {
            Some(b"h2") => HttpProtocol::Http2,
            _ => HttpProtocol::Http1,
        }
    }
}

/// A ready-to-use certificate chain and private key.
pub struct TlsCredential {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Supplies the credential for the public hostname.
pub trait CertificateProvider: Send + Sync {
    fn credential(&self) -> Result<TlsCredential>;
}

/// Reads PEM-encoded certificate and key files.
#[derive(Debug, Clone)]
pub struct PemFileProvider {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl PemFileProvider {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    fn open(path: &PathBuf, what: &str) -> Result<BufReader<File>> {
        let file = File::open(path).map_err(|e| ProxyError::TlsConfig {
            message: format!("failed to open {} file {}: {}", what, path.display(), e),
        })?;
        Ok(BufReader::new(file))
    }
}

impl CertificateProvider for PemFileProvider {
    fn credential(&self) -> Result<TlsCredential> {
        let cert_chain = load_certs(&mut Self::open(&self.cert_path, "cert")?)?;
        let key = load_private_key(&mut Self::open(&self.key_path, "key")?)?;
        Ok(TlsCredential { cert_chain, key })
    }
}

/// Holds PEM text in memory.
#[derive(Debug, Clone)]
pub struct PemProvider {
    cert_pem: String,
    key_pem: String,
}

impl PemProvider {
    pub fn new(cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        Self {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        }
    }
}

impl CertificateProvider for PemProvider {
    fn credential(&self) -> Result<TlsCredential> {
        let cert_chain = load_certs(&mut self.cert_pem.as_bytes())?;
        let key = load_private_key(&mut self.key_pem.as_bytes())?;
        Ok(TlsCredential { cert_chain, key })
    }
}

fn load_certs(reader: &mut dyn BufRead) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(reader)
        .filter_map(|cert| cert.ok())
        .collect();

    if certs.is_empty() {
        return Err(ProxyError::TlsConfig {
            message: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

fn load_private_key(reader: &mut dyn BufRead) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::read_all(reader)
        .filter_map(|item| match item.ok()? {
            rustls_pemfile::Item::Pkcs1Key(key) => Some(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Pkcs8Key(key) => Some(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => Some(PrivateKeyDer::Sec1(key)),
            _ => None,
        })
        .next()
        .ok_or_else(|| ProxyError::TlsConfig {
            message: "no private key found".to_string(),
        })
}

/// Builds a TLS acceptor advertising the given protocols via ALPN.
pub fn build_acceptor(
    provider: &dyn CertificateProvider,
    protocol: HttpProtocol,
) -> Result<TlsAcceptor> {
    let TlsCredential { cert_chain, key } = provider.credential()?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| ProxyError::TlsConfig {
            message: format!("failed to configure TLS: {}", e),
        })?;
    config.alpn_protocols = protocol.alpn_protocols();

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> (String, String) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (cert.cert.pem(), cert.key_pair.serialize_pem())
    }

    #[test]
    fn test_http_protocol_alpn() {
        assert_eq!(
            HttpProtocol::Http1.alpn_protocols(),
            vec![b"http/1.1".to_vec()]
        );
        assert_eq!(
            HttpProtocol::Auto.alpn_protocols(),
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn test_protocol_from_alpn() {
        assert_eq!(HttpProtocol::from_alpn(Some(b"h2")), HttpProtocol::Http2);
        assert_eq!(
            HttpProtocol::from_alpn(Some(b"http/1.1")),
            HttpProtocol::Http1
        );
        assert_eq!(HttpProtocol::from_alpn(None), HttpProtocol::Http1);
    }

    #[test]
    fn test_pem_provider_builds_acceptor() {
        let (cert, key) = self_signed();
        let provider = PemProvider::new(cert, key);
        assert!(build_acceptor(&provider, HttpProtocol::Auto).is_ok());
    }

    #[test]
    fn test_pem_file_provider() {
        let (cert, key) = self_signed();
        let dir = std::env::temp_dir().join(format!("edgemesh-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert).unwrap();
        std::fs::write(&key_path, key).unwrap();

        let provider = PemFileProvider::new(&cert_path, &key_path);
        let credential = provider.credential().unwrap();
        assert_eq!(credential.cert_chain.len(), 1);

        let missing = PemFileProvider::new(dir.join("nope.pem"), &key_path);
        assert!(matches!(
            missing.credential(),
            Err(ProxyError::TlsConfig { .. })
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_garbage_pem_rejected() {
        let provider = PemProvider::new("not a cert", "not a key");
        assert!(build_acceptor(&provider, HttpProtocol::Auto).is_err());
    }
}
