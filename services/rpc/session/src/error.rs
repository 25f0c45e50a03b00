//! Transport error taxonomy.

use rpc_wire::WireError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use crate::session::SessionId;

/// Errors raised by sessions and transports
#[derive(Error, Debug)]
pub enum TransportError {
    /// Configured host could not be resolved to an address
    #[error("could not resolve host \"{host}\"")]
    HostResolution {
        /// Host as configured
        host: String,
        /// Lookup failure, if the resolver reported one
        #[source]
        source: Option<io::Error>,
    },

    /// TCP connect to a resolved endpoint failed
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Resolved endpoint
        addr: SocketAddr,
        /// Connect failure
        #[source]
        source: io::Error,
    },

    /// No usable stream or socket for the operation
    #[error("remote connection lost ({context})")]
    ConnectionLost {
        /// Session or receiver the operation was aimed at
        context: String,
        /// Underlying I/O failure, if any
        #[source]
        source: Option<io::Error>,
    },

    /// TLS negotiation failed
    #[error("TLS handshake with {peer} failed: {reason}")]
    HandshakeFailure {
        /// Remote endpoint
        peer: SocketAddr,
        /// Failure description
        reason: String,
    },

    /// Certificate name has no match in the trust store
    #[error("certificate \"{name}\" not found (store: {store})")]
    CertificateNotFound {
        /// Requested subject name
        name: String,
        /// Store that was searched
        store: String,
    },

    /// The listener was disposed by a deliberate shutdown
    #[error("listener shut down")]
    AcceptTeardownExpected,

    /// Certificate store could not be read
    #[error("certificate store error: {0}")]
    CertificateStore(String),

    /// TLS configuration could not be built
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// Client already holds a live session
    #[error("already connected (session {0})")]
    AlreadyConnected(SessionId),

    /// Operation not valid in the current transport state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Message could not be encoded
    #[error("codec error: {0}")]
    Wire(#[from] WireError),

    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Build a [`TransportError::ConnectionLost`] without an I/O cause
    pub fn connection_lost(context: impl Into<String>) -> Self {
        TransportError::ConnectionLost {
            context: context.into(),
            source: None,
        }
    }

    /// Whether this is the expected result of shutting a listener down
    pub fn is_teardown(&self) -> bool {
        matches!(self, TransportError::AcceptTeardownExpected)
    }

    /// Whether the session this error came from is no longer usable
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TransportError::ConnectionLost { .. })
    }
}

impl From<rustls::Error> for TransportError {
    fn from(err: rustls::Error) -> Self {
        TransportError::Tls(err.to_string())
    }
}
