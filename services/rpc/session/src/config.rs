//! Transport configuration.
//!
//! Everything here is supplied before a connect or listen begins and is not
//! consulted for changes afterwards.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Default receive buffer size (64 KiB)
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Socket options applied to every connection before first use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    /// SO_RCVBUF size, also used as the read buffer size
    pub recv_buffer_size: usize,
    /// SO_SNDBUF size, OS default when unset
    pub send_buffer_size: Option<usize>,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            send_buffer_size: None,
            nodelay: true,
        }
    }
}

/// TLS protocol revisions that may be negotiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsProtocolVersion {
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

fn default_protocol_versions() -> Vec<TlsProtocolVersion> {
    vec![TlsProtocolVersion::Tls12, TlsProtocolVersion::Tls13]
}

/// Server-side TLS settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecureServerSettings {
    /// Subject name of the server certificate in the certificate store
    pub certificate_name: String,
    /// Reject clients that do not present a certificate
    pub client_certificate_required: bool,
    /// PEM bundle of CAs trusted to sign client certificates
    pub client_ca_file: Option<PathBuf>,
    /// Protocol revisions offered during the handshake
    pub protocol_versions: Vec<TlsProtocolVersion>,
    /// Upper bound for a single server handshake
    pub handshake_timeout_secs: u64,
}

impl SecureServerSettings {
    /// Settings for `certificate_name` with defaults for everything else
    pub fn new(certificate_name: impl Into<String>) -> Self {
        Self {
            certificate_name: certificate_name.into(),
            ..Self::default()
        }
    }

    /// Handshake timeout as a [`Duration`]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Default for SecureServerSettings {
    fn default() -> Self {
        Self {
            certificate_name: String::new(),
            client_certificate_required: false,
            client_ca_file: None,
            protocol_versions: default_protocol_versions(),
            handshake_timeout_secs: 10,
        }
    }
}

/// Client-side TLS settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecureClientSettings {
    /// Name the server certificate must be valid for (also sent as SNI)
    pub server_name: String,
    /// PEM bundle of trusted root certificates
    pub ca_file: Option<PathBuf>,
    /// Subject name of the client certificate to present, if any
    pub certificate_name: Option<String>,
    /// Protocol revisions offered during the handshake
    pub protocol_versions: Vec<TlsProtocolVersion>,
    /// Upper bound for the client handshake, counted after the TCP connect
    pub handshake_timeout_secs: u64,
}

impl SecureClientSettings {
    /// Settings verifying the server as `server_name` against `ca_file`
    pub fn new(server_name: impl Into<String>, ca_file: impl Into<PathBuf>) -> Self {
        Self {
            server_name: server_name.into(),
            ca_file: Some(ca_file.into()),
            ..Self::default()
        }
    }

    /// Handshake timeout as a [`Duration`]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Default for SecureClientSettings {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            ca_file: None,
            certificate_name: None,
            protocol_versions: default_protocol_versions(),
            handshake_timeout_secs: 10,
        }
    }
}

/// Server transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerTransportConfig {
    /// Address the listener binds to
    pub listen_addr: SocketAddr,
    /// Options applied to the listener and every accepted socket
    pub socket: SocketOptions,
    /// TLS settings; plain TCP when absent
    pub tls: Option<SecureServerSettings>,
}

impl ServerTransportConfig {
    /// Plain configuration listening on `listen_addr`
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Self::default()
        }
    }
}

impl Default for ServerTransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 52474),
            socket: SocketOptions::default(),
            tls: None,
        }
    }
}

/// Client transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientTransportConfig {
    /// Host name or literal IP address
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Options applied to the socket before connecting
    pub socket: SocketOptions,
    /// Upper bound for the TCP connect
    pub connect_timeout_secs: u64,
    /// TLS settings; plain TCP when absent
    pub tls: Option<SecureClientSettings>,
}

impl ClientTransportConfig {
    /// Plain configuration for `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Connect timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ClientTransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 52474,
            socket: SocketOptions::default(),
            connect_timeout_secs: 10,
            tls: None,
        }
    }
}
