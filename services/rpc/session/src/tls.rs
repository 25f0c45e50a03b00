//! TLS layer for secure sessions.
//!
//! Server and client configurations are built with the `ring` crypto provider
//! and restricted to the configured protocol revisions. Client certificates
//! are verified with webpki against an explicit CA bundle.

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::cert::CertifiedIdentity;
use crate::config::{SecureClientSettings, SecureServerSettings, TlsProtocolVersion};
use crate::error::TransportError;
use crate::transport::IoStream;

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn protocol_versions(
    versions: &[TlsProtocolVersion],
) -> Result<Vec<&'static SupportedProtocolVersion>, TransportError> {
    if versions.is_empty() {
        return Err(TransportError::Tls(
            "no TLS protocol versions configured".to_string(),
        ));
    }

    let mut selected = Vec::with_capacity(versions.len());
    for version in versions {
        let supported = match version {
            TlsProtocolVersion::Tls12 => &TLS12,
            TlsProtocolVersion::Tls13 => &TLS13,
        };
        if !selected.iter().any(|v: &&SupportedProtocolVersion| v.version == supported.version) {
            selected.push(supported);
        }
    }
    Ok(selected)
}

/// Read every certificate from a PEM bundle
pub fn load_pem_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let pem = std::fs::read(path).map_err(|e| {
        TransportError::CertificateStore(format!("failed to read {}: {}", path.display(), e))
    })?;

    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            TransportError::CertificateStore(format!("failed to parse {}: {}", path.display(), e))
        })?;

    if certs.is_empty() {
        return Err(TransportError::CertificateStore(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn root_store(path: &Path) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    for cert in load_pem_certificates(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Create a TLS server configuration from a resolved identity
pub fn build_server_config(
    identity: &CertifiedIdentity,
    settings: &SecureServerSettings,
) -> Result<ServerConfig, TransportError> {
    let provider = crypto_provider();
    let versions = protocol_versions(&settings.protocol_versions)?;

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&versions)?;

    let builder = match &settings.client_ca_file {
        Some(ca_file) => {
            let roots = Arc::new(root_store(ca_file)?);
            let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider);
            let verifier = if settings.client_certificate_required {
                verifier.build()
            } else {
                verifier.allow_unauthenticated().build()
            };
            let verifier =
                verifier.map_err(|e| TransportError::Tls(format!("client verifier: {}", e)))?;
            builder.with_client_cert_verifier(verifier)
        }
        None if settings.client_certificate_required => {
            return Err(TransportError::Tls(
                "client certificates are required but no client CA file is configured"
                    .to_string(),
            ));
        }
        None => builder.with_no_client_auth(),
    };

    let config = builder.with_single_cert(identity.chain().to_vec(), identity.key())?;
    Ok(config)
}

/// Create a TLS client configuration
pub fn build_client_config(
    settings: &SecureClientSettings,
    identity: Option<&CertifiedIdentity>,
) -> Result<ClientConfig, TransportError> {
    let ca_file = settings.ca_file.as_deref().ok_or_else(|| {
        TransportError::Tls("no trusted CA file configured for TLS client".to_string())
    })?;
    let roots = root_store(ca_file)?;
    let versions = protocol_versions(&settings.protocol_versions)?;

    let builder = ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&versions)?
        .with_root_certificates(roots);

    let config = match identity {
        Some(identity) => {
            builder.with_client_auth_cert(identity.chain().to_vec(), identity.key())?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(config)
}

/// Outcome of a server handshake that did not produce a stream
pub struct HandshakeRejected {
    /// Why the handshake failed
    pub error: TransportError,
    /// The raw socket, when the TLS layer handed it back
    pub stream: Option<TcpStream>,
}

/// Run the server side of the TLS handshake on an accepted socket
pub async fn accept_tls(
    config: Arc<ServerConfig>,
    tcp_stream: TcpStream,
    peer: SocketAddr,
    timeout: Duration,
) -> Result<IoStream, HandshakeRejected> {
    debug!("Accepting TLS connection from {}", peer);

    let acceptor = TlsAcceptor::from(config);
    match tokio::time::timeout(timeout, acceptor.accept(tcp_stream).into_fallible()).await {
        Ok(Ok(tls_stream)) => {
            let (_, connection) = tls_stream.get_ref();
            debug!(
                "TLS connection accepted from {} ({:?}, client cert: {})",
                peer,
                connection.protocol_version(),
                connection.peer_certificates().is_some()
            );
            Ok(IoStream::Tls(Box::new(tls_stream)))
        }
        Ok(Err((e, stream))) => Err(HandshakeRejected {
            error: TransportError::HandshakeFailure {
                peer,
                reason: e.to_string(),
            },
            stream: Some(stream),
        }),
        Err(_) => Err(HandshakeRejected {
            error: TransportError::HandshakeFailure {
                peer,
                reason: format!("timed out after {:?}", timeout),
            },
            stream: None,
        }),
    }
}

/// Run the client side of the TLS handshake, giving up after `timeout`
pub async fn connect_tls(
    config: Arc<ClientConfig>,
    tcp_stream: TcpStream,
    sni: &str,
    timeout: Duration,
) -> Result<IoStream, TransportError> {
    let peer = tcp_stream.peer_addr()?;
    debug!("Connecting via TLS to {} (SNI: {})", peer, sni);

    let server_name = ServerName::try_from(sni.to_owned())
        .map_err(|_| TransportError::Tls(format!("invalid server name: {}", sni)))?;

    let connector = TlsConnector::from(config);
    let tls_stream =
        match tokio::time::timeout(timeout, connector.connect(server_name, tcp_stream)).await {
            Ok(Ok(tls_stream)) => tls_stream,
            Ok(Err(e)) => {
                return Err(TransportError::HandshakeFailure {
                    peer,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(TransportError::HandshakeFailure {
                    peer,
                    reason: format!("timed out after {:?}", timeout),
                })
            }
        };

    debug!("TLS connection established to {}", peer);
    Ok(IoStream::TlsClient(Box::new(tls_stream)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn self_signed(name: &str) -> (CertifiedIdentity, String) {
        let certified = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        let identity = CertifiedIdentity::from_der(
            vec![certified.cert.der().clone()],
            certified.key_pair.serialize_der(),
        );
        (identity, certified.cert.pem())
    }

    #[test]
    fn test_protocol_versions_deduplicated() {
        let versions = protocol_versions(&[
            TlsProtocolVersion::Tls13,
            TlsProtocolVersion::Tls13,
            TlsProtocolVersion::Tls12,
        ])
        .unwrap();
        assert_eq!(versions.len(), 2);
        assert!(protocol_versions(&[]).is_err());
    }

    #[test]
    fn test_server_config_without_client_auth() {
        let (identity, _) = self_signed("rpc.test");
        let settings = SecureServerSettings::new("rpc.test");
        assert!(build_server_config(&identity, &settings).is_ok());
    }

    #[test]
    fn test_required_client_cert_needs_ca() {
        let (identity, _) = self_signed("rpc.test");
        let mut settings = SecureServerSettings::new("rpc.test");
        settings.client_certificate_required = true;

        let err = build_server_config(&identity, &settings).unwrap_err();
        assert!(matches!(err, TransportError::Tls(_)));
    }

    #[test]
    fn test_server_config_with_client_ca() {
        let (identity, pem) = self_signed("rpc.test");
        let mut ca_file = tempfile::NamedTempFile::new().unwrap();
        ca_file.write_all(pem.as_bytes()).unwrap();

        let mut settings = SecureServerSettings::new("rpc.test");
        settings.client_certificate_required = true;
        settings.client_ca_file = Some(ca_file.path().to_path_buf());
        assert!(build_server_config(&identity, &settings).is_ok());
    }

    #[test]
    fn test_client_config_requires_ca_file() {
        let settings = SecureClientSettings {
            server_name: "rpc.test".to_string(),
            ..SecureClientSettings::default()
        };
        assert!(matches!(
            build_client_config(&settings, None),
            Err(TransportError::Tls(_))
        ));
    }

    #[test]
    fn test_empty_pem_bundle_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            load_pem_certificates(file.path()),
            Err(TransportError::CertificateStore(_))
        ));
    }
}
