//! rpclink transport node.
//!
//! Runs either a server whose dispatch layer echoes requests back, or a
//! client that sends a few requests and prints the responses.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use rpc_session::{
    CertificateProvider, EventChannelHandler, MemoryCertificateStore, NoopHandler,
    PemDirectoryStore, SecureClientSettings, SecureServerSettings, Session, SessionEvent,
    TcpClient, TcpServer,
};
use rpc_wire::{FrameCodec, GenericMessage, MessageKind};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::NodeConfig;
use logging::RpcLogFormatter;

/// TCP/TLS transport node for rpc
#[derive(Parser, Debug)]
#[command(name = "rpclink", version, about = "TCP/TLS transport node for rpc")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "rpclink.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Listen address for server mode, e.g. 0.0.0.0:52474
    #[arg(long, conflicts_with = "connect")]
    listen: Option<SocketAddr>,

    /// Run as a client connecting to HOST:PORT
    #[arg(long)]
    connect: Option<String>,

    /// Request payload to send in client mode (repeatable)
    #[arg(long, requires = "connect")]
    message: Vec<String>,

    /// Target interface of client requests
    #[arg(long, default_value = "Echo")]
    target: String,

    /// Method of client requests
    #[arg(long, default_value = "Call")]
    method: String,

    /// How long the client waits for each response, e.g. 5s
    #[arg(long, default_value = "5s")]
    response_timeout: humantime::Duration,

    /// Serve TLS with the certificate of this subject name
    #[arg(long, conflicts_with = "connect")]
    tls_cert_name: Option<String>,

    /// Connect with TLS, trusting the CA certificates in this PEM file
    #[arg(long, requires = "connect")]
    tls_ca: Option<PathBuf>,

    /// Name the server certificate must match (defaults to the connect host)
    #[arg(long, requires = "tls_ca")]
    tls_server_name: Option<String>,

    /// Client certificate subject name to present
    #[arg(long, requires = "tls_ca")]
    tls_client_cert_name: Option<String>,

    /// Directory of PEM certificates and keys
    #[arg(long)]
    certificate_dir: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("rpclink={}", args.log_level).parse()?)
        .add_directive(format!("rpc_session={}", args.log_level).parse()?)
        .add_directive(format!("rpc_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(RpcLogFormatter::new("rpclink"))
        .init();

    info!("Starting rpclink v{}", env!("CARGO_PKG_VERSION"));

    let mut node_config = NodeConfig::load_from_file(&args.config)?;
    if let Some(dir) = &args.certificate_dir {
        node_config.certificate_dir = Some(dir.clone());
    }

    match args.connect.clone() {
        Some(endpoint) => run_client(node_config, &endpoint, &args).await,
        None => run_server(node_config, &args).await,
    }
}

async fn run_server(mut node_config: NodeConfig, args: &Args) -> Result<()> {
    if let Some(addr) = args.listen {
        node_config.server.listen_addr = addr;
    }

    let tls = match (&args.tls_cert_name, node_config.server.tls.take()) {
        (Some(name), Some(mut settings)) => {
            settings.certificate_name = name.clone();
            Some(settings)
        }
        (Some(name), None) => Some(SecureServerSettings::new(name.clone())),
        (None, settings) => settings,
    };

    let (handler, mut events) = EventChannelHandler::channel();
    let server: TcpServer = match tls {
        Some(settings) => {
            let dir = node_config
                .certificate_dir
                .clone()
                .context("a secure server needs --certificate-dir or certificate_dir")?;
            info!(
                component = "server",
                "Serving certificate \"{}\" from {:?}",
                settings.certificate_name,
                dir
            );
            TcpServer::secure(
                node_config.server,
                settings,
                Arc::new(PemDirectoryStore::new(dir)),
                FrameCodec::new(),
                Arc::new(handler),
            )
        }
        None => TcpServer::plain(node_config.server, FrameCodec::new(), Arc::new(handler)),
    };

    let addr = server.start().await.context("failed to start listener")?;
    info!(component = "server", "Accepting connections on {}", addr);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                info!(component = "server", "Shutdown requested");
                break;
            }
            event = events.recv() => match event {
                Some(SessionEvent::Established(session)) => {
                    info!(
                        component = "server",
                        "Session {} opened from {}",
                        session.id(),
                        session.remote_addr()
                    );
                    tokio::spawn(echo_dispatch(session));
                }
                Some(SessionEvent::Closed(session)) => {
                    let stats = session.stats();
                    info!(
                        component = "server",
                        "Session {} closed ({} bytes in, {} bytes out)",
                        session.id(),
                        stats.bytes_received,
                        stats.bytes_sent
                    );
                }
                None => break,
            }
        }
    }

    server.stop().await;
    info!("rpclink stopped");
    Ok(())
}

/// Minimal dispatch layer: answer every request with its own payload
async fn echo_dispatch(session: Arc<Session>) {
    while let Some(message) = session.next_message().await {
        match message.kind {
            MessageKind::Request => {
                let response = message.response(message.payload.clone());
                if let Err(e) = session.send_message(&response).await {
                    warn!(
                        component = "dispatch",
                        "Reply to session {} failed: {}",
                        session.id(),
                        e
                    );
                    break;
                }
            }
            MessageKind::OneWay => {
                info!(
                    component = "dispatch",
                    "One-way {}.{} from session {} ({} bytes)",
                    message.target.as_deref().unwrap_or("?"),
                    message.method.as_deref().unwrap_or("?"),
                    session.id(),
                    message.payload.len()
                );
            }
            MessageKind::Response | MessageKind::Exception => {
                debug!(
                    component = "dispatch",
                    "Ignoring unsolicited {:?} {} from session {}",
                    message.kind,
                    message.request_id,
                    session.id()
                );
            }
        }
    }
}

async fn run_client(node_config: NodeConfig, endpoint: &str, args: &Args) -> Result<()> {
    let (host, port) = split_host_port(endpoint)?;
    let mut client_config = node_config.client;
    client_config.host = host.clone();
    client_config.port = port;

    let mut client: TcpClient =
        TcpClient::new(client_config, FrameCodec::new(), Arc::new(NoopHandler));

    if let Some(ca_file) = &args.tls_ca {
        let mut settings = SecureClientSettings::new(
            args.tls_server_name.clone().unwrap_or_else(|| host.clone()),
            ca_file.clone(),
        );
        settings.certificate_name = args.tls_client_cert_name.clone();

        let provider: Arc<dyn CertificateProvider> = match &node_config.certificate_dir {
            Some(dir) => Arc::new(PemDirectoryStore::new(dir.clone())),
            None => Arc::new(MemoryCertificateStore::new()),
        };
        client = client.with_tls(settings, provider);
    }

    let session = client
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}", endpoint))?;
    info!(component = "client", "Connected to {} as session {}", endpoint, session.id());

    for (index, text) in args.message.iter().enumerate() {
        let request = GenericMessage::request(
            index as u64 + 1,
            &args.target,
            &args.method,
            Bytes::from(text.clone()),
        );
        client.send_message(&request).await?;
    }

    let timeout = Duration::from(args.response_timeout);
    let mut outstanding = args.message.len();
    while outstanding > 0 {
        match tokio::time::timeout(timeout, session.next_message()).await {
            Ok(Some(reply)) => {
                println!(
                    "[{}] {:?}: {}",
                    reply.request_id,
                    reply.kind,
                    String::from_utf8_lossy(&reply.payload)
                );
                outstanding -= 1;
            }
            Ok(None) => {
                warn!(
                    component = "client",
                    "Connection closed with {} responses outstanding",
                    outstanding
                );
                break;
            }
            Err(_) => {
                warn!(component = "client", "Timed out waiting for {} responses", outstanding);
                break;
            }
        }
    }

    client.close().await;
    Ok(())
}

/// Split `host:port`, accepting bracketed IPv6 literals
fn split_host_port(endpoint: &str) -> Result<(String, u16)> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .with_context(|| format!("expected HOST:PORT, got \"{}\"", endpoint))?;
    let port = port
        .parse::<u16>()
        .with_context(|| format!("invalid port in \"{}\"", endpoint))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        anyhow::bail!("missing host in \"{}\"", endpoint);
    }
    Ok((host.to_string(), port))
}

async fn shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for Ctrl-C")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}
