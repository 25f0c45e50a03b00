//! TCP/TLS transport and session layer for rpc.
//!
//! This crate turns connected sockets into managed sessions and moves framed
//! messages between them and a dispatch layer. It covers connection
//! establishment in both roles, optional TLS, the per-connection lifecycle,
//! inbound queuing and serialized outbound sends.
//!
//! ## Features
//!
//! - **Client Transport**: [`TcpClient`] resolves, connects and holds one session
//! - **Server Transport**: [`TcpServer`] accepts concurrently, plain or TLS, and
//!   keeps accepting when individual connections fail
//! - **Sessions**: FIFO inbound queue, non-interleaving sends, idempotent close
//! - **Lifecycle notifications**: [`ConnectionHandler`] hears about each session
//!   being established and closed, once each
//! - **Certificates**: [`CertificateProvider`] with PEM-directory and in-memory stores
//!
//! ## Example
//!
//! ```rust,no_run
//! use rpc_session::{
//!     ClientTransportConfig, EventChannelHandler, ServerTransportConfig, SessionEvent,
//!     TcpClient, TcpServer,
//! };
//! use rpc_wire::{FrameCodec, GenericMessage};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (handler, mut events) = EventChannelHandler::channel();
//! let server: TcpServer = TcpServer::plain(
//!     ServerTransportConfig::new("127.0.0.1:0".parse()?),
//!     FrameCodec::new(),
//!     Arc::new(handler),
//! );
//! let addr = server.start().await?;
//!
//! let (client_handler, _client_events) = EventChannelHandler::channel();
//! let client: TcpClient = TcpClient::new(
//!     ClientTransportConfig::new("127.0.0.1", addr.port()),
//!     FrameCodec::new(),
//!     Arc::new(client_handler),
//! );
//! client.connect().await?;
//! client
//!     .send_message(&GenericMessage::request(1, "Inventory", "Lookup", "sku-42".into()))
//!     .await?;
//!
//! if let Some(SessionEvent::Established(session)) = events.recv().await {
//!     while let Some(message) = session.next_message().await {
//!         println!("{:?} {:?}", message.target, message.method);
//!     }
//! }
//!
//! client.close().await;
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod base;
pub mod cert;
pub mod client;
pub mod config;
pub mod error;
pub mod queue;
pub mod registry;
pub mod server;
pub mod session;
pub mod tls;
pub mod transport;

#[cfg(test)]
mod test_utils;

// Re-export main types
pub use base::{
    close_quietly, is_already_closed, log_teardown, ConnectionHandler, EventChannelHandler,
    NoopHandler, SessionEvent, TeardownOutcome, TransportBase,
};
pub use cert::{
    is_currently_valid, subject_matches, CertificateProvider, CertifiedIdentity,
    MemoryCertificateStore, PemDirectoryStore,
};
pub use client::TcpClient;
pub use config::{
    ClientTransportConfig, SecureClientSettings, SecureServerSettings, ServerTransportConfig,
    SocketOptions, TlsProtocolVersion, DEFAULT_RECV_BUFFER_SIZE,
};
pub use error::TransportError;
pub use queue::InboundQueue;
pub use registry::SessionRegistry;
pub use server::{ServerState, TcpServer};
pub use session::{Session, SessionId, SessionStats};
pub use transport::{connect_tcp, listen_tcp, resolve_endpoint, IoStream};
