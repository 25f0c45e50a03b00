//! Client transport: one outbound connection.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rpc_wire::{FrameCodec, MessageCodec};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::base::{close_quietly, ConnectionHandler, TransportBase};
use crate::cert::CertificateProvider;
use crate::config::{ClientTransportConfig, SecureClientSettings};
use crate::error::TransportError;
use crate::session::{Session, SessionId};
use crate::tls;
use crate::transport::{connect_tcp, resolve_endpoint, IoStream};

struct ClientTls {
    settings: SecureClientSettings,
    provider: Option<Arc<dyn CertificateProvider>>,
}

/// Initiates and holds a single outbound session
pub struct TcpClient<C: MessageCodec = FrameCodec> {
    config: ClientTransportConfig,
    codec: C,
    base: Arc<TransportBase<C>>,
    tls: Option<ClientTls>,
    session: Mutex<Option<Arc<Session<C>>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl<C: MessageCodec> TcpClient<C> {
    /// Create a client for `config`.
    ///
    /// A `tls` section in the configuration makes the client secure; a client
    /// certificate can only be presented when a provider is supplied through
    /// [`TcpClient::with_tls`].
    pub fn new(
        config: ClientTransportConfig,
        codec: C,
        handler: Arc<dyn ConnectionHandler<C>>,
    ) -> Self {
        let base = Arc::new(TransportBase::new(config.socket.clone(), handler));
        let tls = config.tls.clone().map(|settings| ClientTls {
            settings,
            provider: None,
        });

        Self {
            config,
            codec,
            base,
            tls,
            session: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Connect over TLS, resolving the client certificate through `provider`
    pub fn with_tls(
        mut self,
        settings: SecureClientSettings,
        provider: Arc<dyn CertificateProvider>,
    ) -> Self {
        self.tls = Some(ClientTls {
            settings,
            provider: Some(provider),
        });
        self
    }

    /// Client configuration
    pub fn config(&self) -> &ClientTransportConfig {
        &self.config
    }

    /// Resolve the configured host and port
    pub async fn resolve(&self) -> Result<SocketAddr, TransportError> {
        resolve_endpoint(&self.config.host, self.config.port).await
    }

    /// Open the connection and start receiving.
    ///
    /// On failure nothing is retained and the error describes the cause.
    pub async fn connect(&self) -> Result<Arc<Session<C>>, TransportError> {
        let _connecting = self.connect_lock.lock().await;

        if let Some(session) = self.session() {
            return Err(TransportError::AlreadyConnected(session.id()));
        }

        let addr = self.resolve().await?;
        debug!("Connecting to {} ({})", self.config.host, addr);

        let tcp_stream = match tokio::time::timeout(
            self.config.connect_timeout(),
            connect_tcp(addr, &self.config.socket),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TransportError::Connect { addr, source: e }),
            Err(_) => {
                return Err(TransportError::Connect {
                    addr,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };

        if let Err(e) = self.base.apply_socket_options(&tcp_stream) {
            close_quietly(tcp_stream).await;
            return Err(e.into());
        }

        let stream = match &self.tls {
            Some(client_tls) => {
                let config = match self.tls_config(client_tls).await {
                    Ok(config) => config,
                    Err(e) => {
                        close_quietly(tcp_stream).await;
                        return Err(e);
                    }
                };
                tls::connect_tls(
                    config,
                    tcp_stream,
                    &client_tls.settings.server_name,
                    client_tls.settings.handshake_timeout(),
                )
                .await?
            }
            None => IoStream::Plain(tcp_stream),
        };

        let session = Session::new(
            stream,
            self.codec.clone(),
            self.config.socket.recv_buffer_size,
        )?;
        if let Err(e) = session.start_receiving(self.base.clone()) {
            session.close().await;
            return Err(e);
        }

        *self.session.lock() = Some(session.clone());
        self.base.establish(&session);

        info!("Connected to {} as session {}", addr, session.id());
        Ok(session)
    }

    async fn tls_config(
        &self,
        client_tls: &ClientTls,
    ) -> Result<Arc<rustls::ClientConfig>, TransportError> {
        let identity = match (&client_tls.settings.certificate_name, &client_tls.provider) {
            (Some(name), Some(provider)) => Some(provider.certificate(name).await?),
            (Some(name), None) => {
                return Err(TransportError::Tls(format!(
                    "client certificate \"{}\" configured without a certificate provider",
                    name
                )))
            }
            (None, _) => None,
        };

        let config = tls::build_client_config(&client_tls.settings, identity.as_ref())?;
        Ok(Arc::new(config))
    }

    /// The live session, if connected
    pub fn session(&self) -> Option<Arc<Session<C>>> {
        let mut slot = self.session.lock();
        if slot.as_ref().is_some_and(|session| session.is_closed()) {
            *slot = None;
        }
        slot.clone()
    }

    /// Whether a live session is held
    pub fn is_connected(&self) -> bool {
        self.session().is_some()
    }

    /// Id of the live session
    pub fn session_id(&self) -> Option<SessionId> {
        self.session().map(|session| session.id())
    }

    /// Connect time of the live session
    pub fn connect_time(&self) -> Option<DateTime<Utc>> {
        self.session().map(|session| session.connect_time())
    }

    /// Free-form description of the live session
    pub fn session_info(&self) -> Option<String> {
        self.session().map(|session| session.session_info())
    }

    fn require_session(
        &self,
        receiver_id: Option<SessionId>,
    ) -> Result<Arc<Session<C>>, TransportError> {
        self.session().ok_or_else(|| {
            let context = match receiver_id {
                Some(id) => format!("receiver {} on {}:{}", id, self.config.host, self.config.port),
                None => format!("{}:{}", self.config.host, self.config.port),
            };
            TransportError::connection_lost(context)
        })
    }

    /// Send raw bytes on the held session.
    ///
    /// `receiver_id` only adds context to errors; a client has one session.
    pub async fn send(
        &self,
        bytes: &[u8],
        receiver_id: Option<SessionId>,
    ) -> Result<(), TransportError> {
        self.require_session(receiver_id)?.send(bytes).await
    }

    /// Encode and send a message on the held session
    pub async fn send_message(&self, message: &C::Message) -> Result<(), TransportError> {
        self.require_session(None)?.send_message(message).await
    }

    /// Backpressure state of the held session; false when not connected
    pub fn is_send_buffer_under_pressure(&self, _receiver_id: Option<SessionId>) -> bool {
        self.session()
            .map(|session| session.is_send_buffer_under_pressure())
            .unwrap_or(false)
    }

    /// Close the held session. Does nothing if not connected.
    pub async fn close(&self) {
        let session = self.session.lock().take();
        match session {
            Some(session) => self.base.close(&session).await,
            None => debug!("Close requested on a client without a session"),
        }
    }
}

impl<C: MessageCodec> Drop for TcpClient<C> {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            if !session.is_closed() {
                warn!(
                    "Client dropped with session {} still open; call close() first",
                    session.id()
                );
            }
        }
    }
}
