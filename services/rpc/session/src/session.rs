//! A single live connection.
//!
//! A [`Session`] owns the byte stream of one connected (and, when secure,
//! authenticated) socket. It serializes outbound writes, runs the read loop
//! that turns bytes into messages, and tears everything down exactly once.

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rpc_wire::{FrameCodec, MessageCodec, WireError};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::base::{is_already_closed, log_teardown, TransportBase};
use crate::error::TransportError;
use crate::queue::InboundQueue;
use crate::transport::IoStream;

/// Upper bound for each teardown step of [`Session::close`]
const CLOSE_STEP_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next identifier; identifiers are never reused
    pub fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Statistics for a session
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Number of completed sends
    pub sends: u64,
    /// Number of messages assembled from the stream
    pub messages_received: u64,
    /// Time of the last successful read or write
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct StatsCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    sends: AtomicU64,
    messages_received: AtomicU64,
    last_activity: Mutex<Option<DateTime<Utc>>>,
}

impl StatsCounters {
    fn touch(&self) {
        *self.last_activity.lock() = Some(Utc::now());
    }
}

/// Why a read loop stopped
enum ReadEnd {
    Cancelled,
    Eof,
    Io(io::Error),
    Malformed(WireError),
}

/// One live logical connection
pub struct Session<C: MessageCodec = FrameCodec> {
    id: SessionId,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    connect_time: DateTime<Utc>,
    secure: bool,
    info: Mutex<String>,
    reader: Mutex<Option<ReadHalf<IoStream>>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<IoStream>>>,
    codec: Mutex<C>,
    queue: InboundQueue<C::Message>,
    read_buffer_size: usize,
    cancel: CancellationToken,
    closed: AtomicBool,
    established: AtomicBool,
    close_notified: AtomicBool,
    stats: StatsCounters,
}

impl<C: MessageCodec> Session<C> {
    /// Wrap a connected stream.
    ///
    /// The session gets a fresh [`SessionId`] and its connect time is now.
    /// Nothing is read until [`Session::start_receiving`] is called.
    pub fn new(
        stream: IoStream,
        codec: C,
        read_buffer_size: usize,
    ) -> Result<Arc<Self>, TransportError> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let secure = stream.is_secure();
        let (reader, writer) = tokio::io::split(stream);

        let session = Arc::new(Self {
            id: SessionId::next(),
            local_addr,
            remote_addr,
            connect_time: Utc::now(),
            secure,
            info: Mutex::new(String::new()),
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            codec: Mutex::new(codec),
            queue: InboundQueue::new(),
            read_buffer_size: read_buffer_size.max(1024),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            established: AtomicBool::new(false),
            close_notified: AtomicBool::new(false),
            stats: StatsCounters::default(),
        });

        debug!(
            "Session {} created ({} -> {}, secure: {})",
            session.id, local_addr, remote_addr, secure
        );
        Ok(session)
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Local endpoint
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote endpoint
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// When the session was created
    pub fn connect_time(&self) -> DateTime<Utc> {
        self.connect_time
    }

    /// Free-form description attached by the application
    pub fn session_info(&self) -> String {
        self.info.lock().clone()
    }

    /// Replace the free-form description
    pub fn set_session_info(&self, info: impl Into<String>) {
        *self.info.lock() = info.into();
    }

    /// Whether the stream is TLS-protected
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Whether the session has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the established notification has been delivered
    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    /// Snapshot of the traffic counters
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            sends: self.stats.sends.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            last_activity: *self.stats.last_activity.lock(),
        }
    }

    fn lost(&self, source: Option<io::Error>) -> TransportError {
        TransportError::ConnectionLost {
            context: format!("session {} ({})", self.id, self.remote_addr),
            source,
        }
    }

    /// Write `bytes` to the stream.
    ///
    /// Concurrent calls are serialized; each payload is written contiguously.
    /// A failed write cancels the session's read loop, which then closes it.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(self.lost(None));
        }

        let mut guard = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(self.lost(None)),
            guard = self.writer.lock() => guard,
        };
        let Some(writer) = guard.as_mut() else {
            return Err(self.lost(None));
        };

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "session closed during send",
            )),
            result = async {
                writer.write_all(bytes).await?;
                writer.flush().await
            } => result,
        };
        drop(guard);

        match result {
            Ok(()) => {
                self.stats
                    .bytes_sent
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                self.stats.sends.fetch_add(1, Ordering::Relaxed);
                self.stats.touch();
                Ok(())
            }
            Err(e) => {
                debug!("Send on session {} failed: {}", self.id, e);
                self.cancel.cancel();
                Err(self.lost(Some(e)))
            }
        }
    }

    /// Encode `message` with this session's codec and send it
    pub async fn send_message(&self, message: &C::Message) -> Result<(), TransportError> {
        let mut buf = BytesMut::new();
        self.codec.lock().encode(message, &mut buf)?;
        self.send(&buf).await
    }

    /// Wait for the next inbound message; `None` once closed and drained
    pub async fn next_message(&self) -> Option<C::Message> {
        self.queue.pop().await
    }

    /// Take the next inbound message if one is queued
    pub fn try_next_message(&self) -> Option<C::Message> {
        self.queue.try_pop()
    }

    /// Number of inbound messages waiting
    pub fn queued_messages(&self) -> usize {
        self.queue.len()
    }

    /// Whether outbound buffering exceeds a backpressure threshold.
    ///
    /// Socket buffer occupancy is not observable here, so this is always false.
    pub fn is_send_buffer_under_pressure(&self) -> bool {
        false
    }

    /// Spawn the read loop.
    ///
    /// The loop runs until the session is closed, the peer disconnects, or
    /// the codec reports a malformed stream, and then closes the session
    /// through `base`. Fails if the loop was already started.
    pub fn start_receiving(
        self: &Arc<Self>,
        base: Arc<TransportBase<C>>,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(self.lost(None));
        }
        let reader = self.reader.lock().take().ok_or_else(|| {
            TransportError::InvalidState(format!("session {} is already receiving", self.id))
        })?;
        let codec = self.codec.lock().clone();
        let session = self.clone();

        tokio::spawn(async move {
            match session.read_loop(reader, codec).await {
                ReadEnd::Cancelled => {
                    debug!("Read loop for session {} stopped", session.id);
                }
                ReadEnd::Eof => {
                    info!(
                        "Session {} closed by peer {}",
                        session.id, session.remote_addr
                    );
                }
                ReadEnd::Io(e) if session.is_closed() || is_already_closed(&e) => {
                    debug!("Session {} read ended: {}", session.id, e);
                }
                ReadEnd::Io(e) => {
                    warn!("Session {} read failed: {}", session.id, e);
                }
                ReadEnd::Malformed(e) => {
                    warn!(
                        "Session {} received malformed data from {}: {}",
                        session.id, session.remote_addr, e
                    );
                }
            }
            base.close(&session).await;
        });

        Ok(())
    }

    async fn read_loop(&self, mut reader: ReadHalf<IoStream>, mut codec: C) -> ReadEnd {
        let mut buf = BytesMut::with_capacity(self.read_buffer_size);

        loop {
            loop {
                match codec.decode(&mut buf) {
                    Ok(Some(message)) => {
                        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                        if !self.queue.push(message) {
                            return ReadEnd::Cancelled;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return ReadEnd::Malformed(e),
                }
            }

            if buf.capacity() - buf.len() < self.read_buffer_size / 4 {
                buf.reserve(self.read_buffer_size);
            }

            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ReadEnd::Cancelled,
                read = reader.read_buf(&mut buf) => read,
            };

            match read {
                Ok(0) => return ReadEnd::Eof,
                Ok(n) => {
                    self.stats
                        .bytes_received
                        .fetch_add(n as u64, Ordering::Relaxed);
                    self.stats.touch();
                }
                Err(e) => return ReadEnd::Io(e),
            }
        }
    }

    /// Tear the session down.
    ///
    /// Stops the read loop, shuts the stream down and discards queued
    /// messages. Returns false if the session was already closed.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();

        let writer = match tokio::time::timeout(CLOSE_STEP_TIMEOUT, self.writer.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                warn!("Session {}: timed out waiting for pending send", self.id);
                None
            }
        };

        if let Some(mut writer) = writer {
            match tokio::time::timeout(CLOSE_STEP_TIMEOUT, writer.shutdown()).await {
                Ok(result) => {
                    log_teardown(&format!("session {} stream", self.id), result);
                }
                Err(_) => {
                    warn!("Session {}: stream shutdown timed out", self.id);
                }
            }
        }

        // Released here only if the read loop never started
        drop(self.reader.lock().take());

        let discarded = self.queue.close_and_drain();
        if discarded > 0 {
            debug!(
                "Session {}: discarded {} queued messages",
                self.id, discarded
            );
        }

        info!("Session {} with {} closed", self.id, self.remote_addr);
        true
    }

    pub(crate) fn mark_established(&self) {
        self.established.store(true, Ordering::SeqCst);
    }

    /// True exactly once, and only for an established session
    pub(crate) fn take_close_notification(&self) -> bool {
        self.is_established() && !self.close_notified.swap(true, Ordering::SeqCst)
    }
}

impl<C: MessageCodec> fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("secure", &self.secure)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::NoopHandler;
    use crate::config::SocketOptions;
    use crate::transport::{connect_tcp, listen_tcp};
    use bytes::Bytes;
    use rpc_wire::GenericMessage;
    use std::collections::HashSet;

    async fn session_pair() -> (Arc<Session>, Arc<Session>) {
        let options = SocketOptions::default();
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap(), &options)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(connect_tcp(addr, &options), listener.accept());
        let client =
            Session::new(IoStream::Plain(client.unwrap()), FrameCodec::new(), 4096).unwrap();
        let server =
            Session::new(IoStream::Plain(accepted.unwrap().0), FrameCodec::new(), 4096).unwrap();
        (client, server)
    }

    fn base() -> Arc<TransportBase> {
        Arc::new(TransportBase::new(
            SocketOptions::default(),
            Arc::new(NoopHandler),
        ))
    }

    #[test]
    fn test_session_ids_unique() {
        let ids: HashSet<_> = (0..1000).map(|_| SessionId::next()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[tokio::test]
    async fn test_session_attributes() {
        let (client, server) = session_pair().await;
        assert_ne!(client.id(), server.id());
        assert_eq!(client.remote_addr(), server.local_addr());
        assert_eq!(client.local_addr(), server.remote_addr());
        assert!(!client.is_secure());
        assert!(!client.is_closed());
        assert!(client.connect_time() <= Utc::now());

        client.set_session_info("inventory client");
        assert_eq!(client.session_info(), "inventory client");
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (client, server) = session_pair().await;
        server.start_receiving(base()).unwrap();

        for i in 0..10u64 {
            let message = GenericMessage::request(
                i,
                "Inventory",
                "Lookup",
                Bytes::from(format!("item-{i}")),
            );
            client.send_message(&message).await.unwrap();
        }

        for i in 0..10u64 {
            let message = server.next_message().await.unwrap();
            assert_eq!(message.request_id, i);
            assert_eq!(message.payload, Bytes::from(format!("item-{i}")));
        }
        assert_eq!(server.stats().messages_received, 10);
        assert_eq!(client.stats().sends, 10);
    }

    #[tokio::test]
    async fn test_receiving_twice_rejected() {
        let (_client, server) = session_pair().await;
        let base = base();
        server.start_receiving(base.clone()).unwrap();
        assert!(matches!(
            server.start_receiving(base),
            Err(TransportError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let (client, _server) = session_pair().await;
        assert!(client.close().await);
        assert!(!client.close().await);
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (client, _server) = session_pair().await;
        client.close().await;

        let err = client.send(b"late").await.unwrap_err();
        assert!(err.is_connection_lost());
    }

    #[tokio::test]
    async fn test_peer_close_ends_session() {
        let (client, server) = session_pair().await;
        server.start_receiving(base()).unwrap();

        client.close().await;
        assert_eq!(server.next_message().await.map(|m| m.request_id), None);
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_malformed_stream_closes_session() {
        let (client, server) = session_pair().await;
        server.start_receiving(base()).unwrap();

        // Frame header with an unsupported version byte
        let mut garbage = vec![0u8; 36];
        garbage[..4].copy_from_slice(&32u32.to_be_bytes());
        garbage[4] = 0xEE;
        client.send(&garbage).await.unwrap();

        assert!(server.next_message().await.is_none());
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_no_backpressure_reported() {
        let (client, _server) = session_pair().await;
        assert!(!client.is_send_buffer_under_pressure());
        client.send(&vec![0u8; 16 * 1024]).await.unwrap();
        assert!(!client.is_send_buffer_under_pressure());
    }
}
