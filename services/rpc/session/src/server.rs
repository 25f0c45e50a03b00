//! Server transport: plain and TLS listeners.
//!
//! The accept loop runs on its own task and hands every accepted socket to a
//! separate task tracked by a [`TaskTracker`], so a slow or hostile handshake
//! never delays the next accept. Any failure while setting up one connection
//! is logged, its socket is closed, and the loop carries on. Only
//! [`TcpServer::stop`] ends the loop.

use parking_lot::Mutex;
use rpc_wire::{FrameCodec, MessageCodec};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::base::{close_quietly, ConnectionHandler, TransportBase};
use crate::cert::CertificateProvider;
use crate::config::{SecureServerSettings, ServerTransportConfig};
use crate::error::TransportError;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionId};
use crate::tls;
use crate::transport::{listen_tcp, IoStream};

/// Pause after an accept error before accepting again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of a server transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Created, not yet listening
    Idle,
    /// Accepting connections
    Listening,
    /// Shut down; cannot be restarted
    Stopped,
}

enum ServerSecurity {
    Plain,
    Tls {
        settings: SecureServerSettings,
        provider: Arc<dyn CertificateProvider>,
    },
}

/// A connection that could not be turned into a session
struct SetupFailure {
    error: TransportError,
    stream: Option<TcpStream>,
}

impl SetupFailure {
    fn new(error: TransportError, stream: Option<TcpStream>) -> Self {
        Self { error, stream }
    }
}

struct ServerInner<C: MessageCodec> {
    config: ServerTransportConfig,
    codec: C,
    security: ServerSecurity,
    base: Arc<TransportBase<C>>,
    registry: Arc<SessionRegistry<C>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl<C: MessageCodec> ServerInner<C> {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    let inner = self.clone();
                    self.tracker
                        .spawn(async move { inner.handle_connection(stream, peer).await });
                }
                Err(e) => {
                    let err = self.accept_error(e);
                    if err.is_teardown() {
                        debug!("Listener closed during shutdown");
                        break;
                    }
                    error!("Accept failed: {}", err);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        drop(listener);
        debug!("Accept loop stopped");
    }

    fn accept_error(&self, err: io::Error) -> TransportError {
        if self.shutdown.is_cancelled() {
            TransportError::AcceptTeardownExpected
        } else {
            TransportError::Io(err)
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let setup = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                Err(SetupFailure::new(TransportError::AcceptTeardownExpected, None))
            }
            setup = self.setup_session(stream, peer) => setup,
        };

        let session = match setup {
            Ok(session) => session,
            Err(failure) => {
                if failure.error.is_teardown() {
                    debug!("Dropped connection from {} during shutdown", peer);
                } else {
                    error!("Failed to set up connection from {}: {}", peer, failure.error);
                }
                if let Some(stream) = failure.stream {
                    close_quietly(stream).await;
                }
                return;
            }
        };

        if self.shutdown.is_cancelled() {
            session.close().await;
            return;
        }

        self.registry.insert(session.clone());
        if let Err(e) = session.start_receiving(self.base.clone()) {
            warn!("Session {} could not start receiving: {}", session.id(), e);
            self.base.close(&session).await;
            return;
        }
        self.base.establish(&session);
    }

    async fn setup_session(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<Arc<Session<C>>, SetupFailure> {
        if let Err(e) = self.base.apply_socket_options(&stream) {
            return Err(SetupFailure::new(e.into(), Some(stream)));
        }

        let io_stream = match &self.security {
            ServerSecurity::Plain => IoStream::Plain(stream),
            ServerSecurity::Tls { settings, provider } => {
                let config = match self.tls_config(settings, provider.as_ref()).await {
                    Ok(config) => config,
                    Err(e) => return Err(SetupFailure::new(e, Some(stream))),
                };
                tls::accept_tls(config, stream, peer, settings.handshake_timeout())
                    .await
                    .map_err(|rejected| SetupFailure::new(rejected.error, rejected.stream))?
            }
        };

        Session::new(io_stream, self.codec.clone(), self.config.socket.recv_buffer_size)
            .map_err(|e| SetupFailure::new(e, None))
    }

    /// Resolved on every accept so a certificate added to the store later is
    /// picked up without a restart
    async fn tls_config(
        &self,
        settings: &SecureServerSettings,
        provider: &dyn CertificateProvider,
    ) -> Result<Arc<rustls::ServerConfig>, TransportError> {
        let identity = provider.certificate(&settings.certificate_name).await?;
        Ok(Arc::new(tls::build_server_config(&identity, settings)?))
    }
}

/// Accepts inbound connections and tracks their sessions
pub struct TcpServer<C: MessageCodec = FrameCodec> {
    inner: Arc<ServerInner<C>>,
    state: Mutex<ServerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: MessageCodec> TcpServer<C> {
    fn with_security(
        config: ServerTransportConfig,
        security: ServerSecurity,
        codec: C,
        handler: Arc<dyn ConnectionHandler<C>>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let base = Arc::new(
            TransportBase::new(config.socket.clone(), handler).with_registry(registry.clone()),
        );

        Self {
            inner: Arc::new(ServerInner {
                config,
                codec,
                security,
                base,
                registry,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
            state: Mutex::new(ServerState::Idle),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
        }
    }

    /// Plain TCP server. Any `tls` section in `config` is ignored.
    pub fn plain(
        config: ServerTransportConfig,
        codec: C,
        handler: Arc<dyn ConnectionHandler<C>>,
    ) -> Self {
        Self::with_security(config, ServerSecurity::Plain, codec, handler)
    }

    /// TLS server presenting the certificate named in `settings`
    pub fn secure(
        config: ServerTransportConfig,
        settings: SecureServerSettings,
        provider: Arc<dyn CertificateProvider>,
        codec: C,
        handler: Arc<dyn ConnectionHandler<C>>,
    ) -> Self {
        Self::with_security(
            config,
            ServerSecurity::Tls { settings, provider },
            codec,
            handler,
        )
    }

    /// Bind the listener and start accepting. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, TransportError> {
        let current = *self.state.lock();
        if current != ServerState::Idle {
            return Err(TransportError::InvalidState(format!(
                "server cannot start from {:?}",
                current
            )));
        }

        let listener = listen_tcp(self.inner.config.listen_addr, &self.inner.config.socket).await?;
        let addr = listener.local_addr()?;

        {
            let mut state = self.state.lock();
            if *state != ServerState::Idle {
                return Err(TransportError::InvalidState(format!(
                    "server cannot start from {:?}",
                    *state
                )));
            }
            *state = ServerState::Listening;
        }

        *self.local_addr.lock() = Some(addr);
        let task = tokio::spawn(self.inner.clone().accept_loop(listener));
        *self.accept_task.lock() = Some(task);

        let mode = match self.inner.security {
            ServerSecurity::Plain => "plain",
            ServerSecurity::Tls { .. } => "TLS",
        };
        info!("Listening on {} ({})", addr, mode);
        Ok(addr)
    }

    /// Stop accepting, wait for in-flight setups and close every session
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == ServerState::Stopped {
                return;
            }
            *state = ServerState::Stopped;
        }

        self.inner.shutdown.cancel();

        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        let sessions = self.inner.registry.sessions();
        let count = sessions.len();
        for session in sessions {
            self.inner.base.close(&session).await;
        }

        info!("Server stopped ({} sessions closed)", count);
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Bound address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Live sessions
    pub fn registry(&self) -> &Arc<SessionRegistry<C>> {
        &self.inner.registry
    }

    /// Look up a live session
    pub fn session(&self, id: SessionId) -> Option<Arc<Session<C>>> {
        self.inner.registry.get(id)
    }

    fn require_session(&self, receiver_id: SessionId) -> Result<Arc<Session<C>>, TransportError> {
        self.session(receiver_id)
            .ok_or_else(|| TransportError::connection_lost(format!("receiver {}", receiver_id)))
    }

    /// Send raw bytes to one session
    pub async fn send(&self, bytes: &[u8], receiver_id: SessionId) -> Result<(), TransportError> {
        self.require_session(receiver_id)?.send(bytes).await
    }

    /// Encode and send a message to one session
    pub async fn send_message(
        &self,
        message: &C::Message,
        receiver_id: SessionId,
    ) -> Result<(), TransportError> {
        self.require_session(receiver_id)?
            .send_message(message)
            .await
    }

    /// Close one session. Returns false if it is not registered.
    pub async fn close_session(&self, id: SessionId) -> bool {
        match self.session(id) {
            Some(session) => {
                self.inner.base.close(&session).await;
                true
            }
            None => false,
        }
    }

    /// Backpressure state of one session; false if it is not registered
    pub fn is_send_buffer_under_pressure(&self, receiver_id: SessionId) -> bool {
        self.session(receiver_id)
            .map(|session| session.is_send_buffer_under_pressure())
            .unwrap_or(false)
    }
}

impl<C: MessageCodec> Drop for TcpServer<C> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();

        let open = self.inner.registry.len();
        if open > 0 {
            warn!(
                "Server dropped with {} sessions still open; call stop() first",
                open
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{EventChannelHandler, NoopHandler, SessionEvent};
    use crate::test_utils::capture_logs;
    use tokio::io::AsyncWriteExt;

    fn local_config() -> ServerTransportConfig {
        ServerTransportConfig::new("127.0.0.1:0".parse().unwrap())
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let server: TcpServer =
            TcpServer::plain(local_config(), FrameCodec::new(), Arc::new(NoopHandler));
        assert_eq!(server.state(), ServerState::Idle);
        assert!(server.local_addr().is_none());

        let addr = server.start().await.unwrap();
        assert_eq!(server.state(), ServerState::Listening);
        assert_eq!(server.local_addr(), Some(addr));
        assert!(matches!(
            server.start().await,
            Err(TransportError::InvalidState(_))
        ));

        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);
        server.stop().await;
        assert!(server.start().await.is_err());
    }

    #[tokio::test]
    async fn test_accept_registers_and_stop_closes() {
        let (handler, mut events) = EventChannelHandler::channel();
        let server: TcpServer =
            TcpServer::plain(local_config(), FrameCodec::new(), Arc::new(handler));
        let addr = server.start().await.unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let session = match events.recv().await {
            Some(SessionEvent::Established(session)) => session,
            other => panic!("unexpected event: {:?}", other),
        };
        assert!(server.registry().contains(session.id()));
        assert!(!server.is_send_buffer_under_pressure(session.id()));

        server.stop().await;
        assert!(matches!(events.recv().await, Some(SessionEvent::Closed(_))));
        assert!(server.registry().is_empty());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_peer_disconnect_unregisters() {
        let (handler, mut events) = EventChannelHandler::channel();
        let server: TcpServer =
            TcpServer::plain(local_config(), FrameCodec::new(), Arc::new(handler));
        let addr = server.start().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let established = events.recv().await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        match events.recv().await {
            Some(SessionEvent::Closed(session)) => {
                assert_eq!(session.id(), established.session().id());
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(server.registry().is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_session() {
        let server: TcpServer =
            TcpServer::plain(local_config(), FrameCodec::new(), Arc::new(NoopHandler));
        server.start().await.unwrap();

        let err = server.send(b"data", SessionId::next()).await.unwrap_err();
        assert!(err.is_connection_lost());
        assert!(!server.close_session(SessionId::next()).await);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_drop_with_open_sessions_warns() {
        let (logs, subscriber) = capture_logs();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (handler, mut events) = EventChannelHandler::channel();
        let server: TcpServer =
            TcpServer::plain(local_config(), FrameCodec::new(), Arc::new(handler));
        let addr = server.start().await.unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let session = match events.recv().await {
            Some(SessionEvent::Established(session)) => session,
            other => panic!("unexpected event: {:?}", other),
        };
        logs.take();

        drop(server);
        let output = logs.take();
        assert!(output.contains("WARN"), "{output}");
        assert!(output.contains("1 sessions still open"), "{output}");
        session.close().await;
    }

    #[tokio::test]
    async fn test_drop_after_stop_is_quiet() {
        let (logs, subscriber) = capture_logs();
        let _guard = tracing::subscriber::set_default(subscriber);

        let server: TcpServer =
            TcpServer::plain(local_config(), FrameCodec::new(), Arc::new(NoopHandler));
        let addr = server.start().await.unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        server.stop().await;
        logs.take();

        drop(server);
        assert!(!logs.take().contains("still open"));
    }
}
