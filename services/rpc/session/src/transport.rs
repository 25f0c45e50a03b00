//! TCP transport primitives shared by client and server roles.
//!
//! This module provides the unified plain/TLS byte stream, socket option
//! handling, endpoint resolution, and listener/dialer helpers.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::debug;

use crate::config::SocketOptions;
use crate::error::TransportError;

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS-wrapped stream (accepted by a server)
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    /// TLS client stream
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            IoStream::Plain(stream) => stream,
            IoStream::Tls(stream) => stream.get_ref().0,
            IoStream::TlsClient(stream) => stream.get_ref().0,
        }
    }

    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    /// Get the local address of the underlying stream
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().local_addr()
    }

    /// Whether the stream is TLS-wrapped
    pub fn is_secure(&self) -> bool {
        !matches!(self, IoStream::Plain(_))
    }
}

/// Apply `options` to a connected socket
pub fn apply_socket_options(stream: &TcpStream, options: &SocketOptions) -> io::Result<()> {
    stream.set_nodelay(options.nodelay)?;

    let sock = socket2::SockRef::from(stream);
    sock.set_recv_buffer_size(options.recv_buffer_size)?;
    if let Some(size) = options.send_buffer_size {
        sock.set_send_buffer_size(size)?;
    }
    Ok(())
}

fn new_socket(addr: &SocketAddr, options: &SocketOptions) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    socket.set_recv_buffer_size(u32::try_from(options.recv_buffer_size).unwrap_or(u32::MAX))?;
    if let Some(size) = options.send_buffer_size {
        socket.set_send_buffer_size(u32::try_from(size).unwrap_or(u32::MAX))?;
    }
    Ok(socket)
}

/// Create a TCP listener bound to the given address.
///
/// Accepted sockets inherit the buffer sizes configured here.
pub async fn listen_tcp(addr: SocketAddr, options: &SocketOptions) -> io::Result<TcpListener> {
    let socket = new_socket(&addr, options)?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

/// Connect to a TCP address with `options` applied before the handshake
pub async fn connect_tcp(addr: SocketAddr, options: &SocketOptions) -> io::Result<TcpStream> {
    let socket = new_socket(&addr, options)?;
    socket.connect(addr).await
}

/// Resolve `host:port`.
///
/// Literal addresses are used directly; names go through the system resolver
/// and the first returned address wins.
pub async fn resolve_endpoint(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TransportError::HostResolution {
            host: host.to_string(),
            source: Some(e),
        })?;

    let addr = addrs.next().ok_or_else(|| TransportError::HostResolution {
        host: host.to_string(),
        source: None,
    })?;
    debug!("Resolved {} to {}", host, addr);
    Ok(addr)
}
