//! Role-independent connection lifecycle.
//!
//! [`TransportBase`] is shared by the client and server transports. It
//! applies socket options and delivers the established/closed notifications
//! to the dispatch layer, each exactly once per session.

use rpc_wire::{FrameCodec, MessageCodec};
use std::io;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::SocketOptions;
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::transport;

/// Dispatch-layer notifications for session lifecycle changes
pub trait ConnectionHandler<C: MessageCodec = FrameCodec>: Send + Sync + 'static {
    /// A session is ready: constructed, receiving, and (server role) registered
    fn on_connection_established(&self, session: &Arc<Session<C>>);

    /// An established session has been closed, by request or by failure
    fn on_connection_closed(&self, session: &Arc<Session<C>>);
}

/// Handler that ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl<C: MessageCodec> ConnectionHandler<C> for NoopHandler {
    fn on_connection_established(&self, _session: &Arc<Session<C>>) {}

    fn on_connection_closed(&self, _session: &Arc<Session<C>>) {}
}

/// Lifecycle notification forwarded by [`EventChannelHandler`]
pub enum SessionEvent<C: MessageCodec = FrameCodec> {
    /// Session became established
    Established(Arc<Session<C>>),
    /// Session was closed
    Closed(Arc<Session<C>>),
}

impl<C: MessageCodec> SessionEvent<C> {
    /// Session the event refers to
    pub fn session(&self) -> &Arc<Session<C>> {
        match self {
            SessionEvent::Established(session) | SessionEvent::Closed(session) => session,
        }
    }
}

impl<C: MessageCodec> std::fmt::Debug for SessionEvent<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Established(session) => {
                f.debug_tuple("Established").field(&session.id()).finish()
            }
            SessionEvent::Closed(session) => f.debug_tuple("Closed").field(&session.id()).finish(),
        }
    }
}

/// Handler that forwards notifications over a channel
pub struct EventChannelHandler<C: MessageCodec = FrameCodec> {
    tx: mpsc::UnboundedSender<SessionEvent<C>>,
}

impl<C: MessageCodec> EventChannelHandler<C> {
    /// Create a handler and the receiving end of its event channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent<C>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SessionEvent<C>) {
        if self.tx.send(event).is_err() {
            trace!("Session event dropped: receiver gone");
        }
    }
}

impl<C: MessageCodec> ConnectionHandler<C> for EventChannelHandler<C> {
    fn on_connection_established(&self, session: &Arc<Session<C>>) {
        self.forward(SessionEvent::Established(session.clone()));
    }

    fn on_connection_closed(&self, session: &Arc<Session<C>>) {
        self.forward(SessionEvent::Closed(session.clone()));
    }
}

/// Shared client/server connection lifecycle
pub struct TransportBase<C: MessageCodec = FrameCodec> {
    options: SocketOptions,
    handler: Arc<dyn ConnectionHandler<C>>,
    registry: Option<Arc<SessionRegistry<C>>>,
}

impl<C: MessageCodec> TransportBase<C> {
    /// Create a base that notifies `handler`
    pub fn new(options: SocketOptions, handler: Arc<dyn ConnectionHandler<C>>) -> Self {
        Self {
            options,
            handler,
            registry: None,
        }
    }

    /// Remove closed sessions from `registry`
    pub fn with_registry(mut self, registry: Arc<SessionRegistry<C>>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Socket options applied to every connection
    pub fn options(&self) -> &SocketOptions {
        &self.options
    }

    /// Registry closed sessions are removed from, if any
    pub fn registry(&self) -> Option<&Arc<SessionRegistry<C>>> {
        self.registry.as_ref()
    }

    /// Apply the configured options to a connected socket
    pub fn apply_socket_options(&self, stream: &TcpStream) -> io::Result<()> {
        transport::apply_socket_options(stream, &self.options)
    }

    /// Deliver the established notification for `session`.
    ///
    /// If the session was closed while the notification ran, the closed
    /// notification follows immediately.
    pub fn establish(&self, session: &Arc<Session<C>>) {
        info!(
            "Connection established: session {} ({} -> {})",
            session.id(),
            session.local_addr(),
            session.remote_addr()
        );
        self.handler.on_connection_established(session);
        session.mark_established();

        if session.is_closed() && session.take_close_notification() {
            self.handler.on_connection_closed(session);
        }
    }

    /// Close `session` and notify the dispatch layer once teardown is done.
    ///
    /// Safe to call repeatedly and concurrently; the closed notification is
    /// only delivered for established sessions, and only once.
    pub async fn close(&self, session: &Arc<Session<C>>) {
        session.close().await;

        if let Some(registry) = &self.registry {
            registry.remove(session.id());
        }

        if session.take_close_notification() {
            debug!("Notifying close of session {}", session.id());
            self.handler.on_connection_closed(session);
        }
    }
}

/// Result of a best-effort socket teardown
#[derive(Debug)]
pub enum TeardownOutcome {
    /// Socket shut down cleanly
    Closed,
    /// Socket was already closed or reset by the peer
    AlreadyClosed,
    /// Teardown failed for another reason (logged)
    Failed(io::Error),
}

/// Whether `err` only says the connection is already gone
pub fn is_already_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

/// Classify the result of shutting `what` down and log it.
///
/// "Already closed" conditions are logged at debug level; any other failure
/// is logged as a warning.
pub fn log_teardown(what: &str, result: io::Result<()>) -> TeardownOutcome {
    match result {
        Ok(()) => TeardownOutcome::Closed,
        Err(e) if is_already_closed(&e) => {
            debug!("{} already closed: {}", what, e);
            TeardownOutcome::AlreadyClosed
        }
        Err(e) => {
            warn!("Failed to close {}: {}", what, e);
            TeardownOutcome::Failed(e)
        }
    }
}

/// Shut down and release a raw socket without propagating failures.
///
/// An already-closed socket is not an error; anything else is logged.
pub async fn close_quietly(mut stream: TcpStream) -> TeardownOutcome {
    let result = stream.shutdown().await;
    log_teardown("socket", result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::capture_logs;
    use crate::transport::{connect_tcp, listen_tcp, IoStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        established: AtomicUsize,
        closed: AtomicUsize,
    }

    impl ConnectionHandler for CountingHandler {
        fn on_connection_established(&self, _session: &Arc<Session>) {
            self.established.fetch_add(1, Ordering::SeqCst);
        }

        fn on_connection_closed(&self, _session: &Arc<Session>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let options = SocketOptions::default();
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap(), &options)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(connect_tcp(addr, &options), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    async fn session() -> (Arc<Session>, TcpStream) {
        let (client, server) = connected_pair().await;
        let session = Session::new(IoStream::Plain(client), FrameCodec::new(), 4096).unwrap();
        (session, server)
    }

    #[test]
    fn test_already_closed_kinds() {
        for kind in [
            io::ErrorKind::NotConnected,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
        ] {
            assert!(is_already_closed(&io::Error::from(kind)));
        }
        assert!(!is_already_closed(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
        assert!(!is_already_closed(&io::Error::from(io::ErrorKind::Other)));
    }

    #[test]
    fn test_teardown_failures_are_logged() {
        let (logs, subscriber) = capture_logs();

        tracing::subscriber::with_default(subscriber, || {
            let outcome = log_teardown(
                "socket",
                Err(io::Error::from(io::ErrorKind::PermissionDenied)),
            );
            assert!(matches!(outcome, TeardownOutcome::Failed(_)));
            let output = logs.take();
            assert!(output.contains("WARN"), "{output}");
            assert!(output.contains("Failed to close socket"), "{output}");

            let outcome = log_teardown("socket", Err(io::Error::from(io::ErrorKind::BrokenPipe)));
            assert!(matches!(outcome, TeardownOutcome::AlreadyClosed));
            let output = logs.take();
            assert!(!output.contains("WARN"), "{output}");
            assert!(output.contains("already closed"), "{output}");

            assert!(matches!(log_teardown("socket", Ok(())), TeardownOutcome::Closed));
            assert!(logs.take().is_empty());
        });
    }

    #[tokio::test]
    async fn test_close_quietly() {
        let (client, _server) = connected_pair().await;
        assert!(matches!(
            close_quietly(client).await,
            TeardownOutcome::Closed | TeardownOutcome::AlreadyClosed
        ));
    }

    #[tokio::test]
    async fn test_close_notifies_once() {
        let handler = Arc::new(CountingHandler::default());
        let base: TransportBase = TransportBase::new(SocketOptions::default(), handler.clone());
        let (session, _peer) = session().await;

        base.establish(&session);
        base.close(&session).await;
        base.close(&session).await;

        assert_eq!(handler.established.load(Ordering::SeqCst), 1);
        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unestablished_close_not_notified() {
        let handler = Arc::new(CountingHandler::default());
        let base: TransportBase = TransportBase::new(SocketOptions::default(), handler.clone());
        let (session, _peer) = session().await;

        base.close(&session).await;
        assert!(session.is_closed());
        assert_eq!(handler.closed.load(Ordering::SeqCst), 0);

        // Established after closing: closed follows right away
        base.establish(&session);
        assert_eq!(handler.established.load(Ordering::SeqCst), 1);
        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_removes_from_registry() {
        let registry = Arc::new(SessionRegistry::new());
        let base: TransportBase =
            TransportBase::new(SocketOptions::default(), Arc::new(NoopHandler))
                .with_registry(registry.clone());
        let (session, _peer) = session().await;

        assert!(registry.insert(session.clone()));
        base.establish(&session);
        base.close(&session).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_event_channel_handler() {
        let (handler, mut events) = EventChannelHandler::channel();
        let base: TransportBase = TransportBase::new(SocketOptions::default(), Arc::new(handler));
        let (session, _peer) = session().await;

        base.establish(&session);
        base.close(&session).await;

        let event = events.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::Established(_)));
        assert_eq!(event.session().id(), session.id());
        assert!(matches!(events.recv().await, Some(SessionEvent::Closed(_))));
    }
}
