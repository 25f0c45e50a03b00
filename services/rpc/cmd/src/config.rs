//! Configuration handling for the rpclink binary.
//!
//! Settings come from a YAML file, then environment variables, then the
//! command line (applied in `main`).

use anyhow::Result;
use rpc_session::{ClientTransportConfig, ServerTransportConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the server listen address
pub const ENV_LISTEN_ADDR: &str = "RPC_LISTEN_ADDR";
/// Environment variable overriding the client host
pub const ENV_CONNECT_HOST: &str = "RPC_CONNECT_HOST";
/// Environment variable overriding the client port
pub const ENV_CONNECT_PORT: &str = "RPC_CONNECT_PORT";
/// Environment variable overriding the receive buffer size of both roles
pub const ENV_RECV_BUFFER_SIZE: &str = "RPC_RECV_BUFFER_SIZE";
/// Environment variable overriding the certificate directory
pub const ENV_CERTIFICATE_DIR: &str = "RPC_CERTIFICATE_DIR";

/// Node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Server transport settings
    pub server: ServerTransportConfig,
    /// Client transport settings
    pub client: ClientTransportConfig,
    /// Directory of PEM certificates used by secure transports
    pub certificate_dir: Option<PathBuf>,
}

impl NodeConfig {
    /// Load configuration from `config_path` and the environment.
    ///
    /// A missing or unparsable file is not fatal; defaults are used instead.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<NodeConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides looked up by environment variable name
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(ENV_LISTEN_ADDR) {
            match value.parse::<SocketAddr>() {
                Ok(addr) => {
                    self.server.listen_addr = addr;
                    info!("Listen address overridden by environment: {}", addr);
                }
                Err(_) => warn!("Ignoring invalid {}: {}", ENV_LISTEN_ADDR, value),
            }
        }

        if let Some(host) = lookup(ENV_CONNECT_HOST) {
            info!("Connect host overridden by environment: {}", host);
            self.client.host = host;
        }

        if let Some(value) = lookup(ENV_CONNECT_PORT) {
            match value.parse::<u16>() {
                Ok(port) => {
                    self.client.port = port;
                    info!("Connect port overridden by environment: {}", port);
                }
                Err(_) => warn!("Ignoring invalid {}: {}", ENV_CONNECT_PORT, value),
            }
        }

        if let Some(value) = lookup(ENV_RECV_BUFFER_SIZE) {
            match value.parse::<usize>() {
                Ok(size) if size > 0 => {
                    self.server.socket.recv_buffer_size = size;
                    self.client.socket.recv_buffer_size = size;
                    info!("Receive buffer size overridden by environment: {}", size);
                }
                _ => warn!("Ignoring invalid {}: {}", ENV_RECV_BUFFER_SIZE, value),
            }
        }

        if let Some(dir) = lookup(ENV_CERTIFICATE_DIR) {
            info!("Certificate directory overridden by environment: {}", dir);
            self.certificate_dir = Some(PathBuf::from(dir));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc_session::TlsProtocolVersion;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.server.listen_addr.port(), 52474);
        assert_eq!(config.client.host, "localhost");
        assert!(config.server.tls.is_none());
        assert!(config.certificate_dir.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
certificate_dir: /etc/rpclink/certs
server:
  listen_addr: 127.0.0.1:7000
  socket:
    recv_buffer_size: 131072
  tls:
    certificate_name: node.rpc.internal
    client_certificate_required: true
    client_ca_file: /etc/rpclink/ca.pem
    protocol_versions: [tls13]
client:
  host: peer.rpc.internal
  port: 7001
  connect_timeout_secs: 3
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = NodeConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.server.listen_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.server.socket.recv_buffer_size, 131072);
        assert!(config.server.socket.nodelay);

        let tls = config.server.tls.unwrap();
        assert_eq!(tls.certificate_name, "node.rpc.internal");
        assert!(tls.client_certificate_required);
        assert_eq!(tls.protocol_versions, vec![TlsProtocolVersion::Tls13]);
        assert_eq!(tls.handshake_timeout_secs, 10);

        assert_eq!(config.client.host, "peer.rpc.internal");
        assert_eq!(config.client.port, 7001);
        assert_eq!(config.client.connect_timeout_secs, 3);
        assert_eq!(
            config.certificate_dir,
            Some(PathBuf::from("/etc/rpclink/certs"))
        );
    }

    #[test]
    fn test_unparsable_file_uses_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"server: [not, a, map").unwrap();

        let config = NodeConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.server, ServerTransportConfig::default());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_LISTEN_ADDR, "127.0.0.1:9100"),
            (ENV_CONNECT_HOST, "10.1.2.3"),
            (ENV_CONNECT_PORT, "not-a-port"),
            (ENV_RECV_BUFFER_SIZE, "8192"),
            (ENV_CERTIFICATE_DIR, "/tmp/certs"),
        ]
        .into_iter()
        .collect();

        let mut config = NodeConfig::default();
        config.apply_overrides(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(config.server.listen_addr.port(), 9100);
        assert_eq!(config.client.host, "10.1.2.3");
        assert_eq!(config.client.port, 52474);
        assert_eq!(config.server.socket.recv_buffer_size, 8192);
        assert_eq!(config.client.socket.recv_buffer_size, 8192);
        assert_eq!(config.certificate_dir, Some(PathBuf::from("/tmp/certs")));
    }
}
