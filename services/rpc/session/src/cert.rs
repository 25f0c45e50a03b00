//! Certificate lookup for secure transports.
//!
//! A [`CertificateProvider`] resolves a certificate subject name to a
//! certificate chain plus private key. Two stores are provided: a directory
//! of PEM files and an in-memory map.

use async_trait::async_trait;
use dashmap::DashMap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use x509_parser::extensions::GeneralName;

use crate::error::TransportError;

/// Certificate chain and matching private key
#[derive(Clone)]
pub struct CertifiedIdentity {
    chain: Vec<CertificateDer<'static>>,
    key: Arc<PrivateKeyDer<'static>>,
}

impl CertifiedIdentity {
    /// Create an identity from a chain (leaf first) and its private key
    pub fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self {
            chain,
            key: Arc::new(key),
        }
    }

    /// Create an identity from DER certificates and a PKCS#8 DER key
    pub fn from_der(chain: Vec<CertificateDer<'static>>, pkcs8_key: Vec<u8>) -> Self {
        Self::new(chain, PrivateKeyDer::from(PrivatePkcs8KeyDer::from(pkcs8_key)))
    }

    /// Certificate chain, leaf first
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Copy of the private key
    pub fn key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }
}

impl fmt::Debug for CertifiedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertifiedIdentity")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Resolves named certificates from a trust store
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Look up the certificate whose subject matches `name`.
    ///
    /// Fails with [`TransportError::CertificateNotFound`] when nothing matches.
    async fn certificate(&self, name: &str) -> Result<CertifiedIdentity, TransportError>;

    /// Human-readable description of the store, used in diagnostics
    fn store_name(&self) -> String;
}

/// Whether `name` occurs (case-insensitively) in the certificate's subject
/// common name or in one of its DNS subject alternative names
pub fn subject_matches(cert_der: &[u8], name: &str) -> Result<bool, TransportError> {
    let (_remaining, cert) = x509_parser::parse_x509_certificate(cert_der).map_err(|e| {
        TransportError::CertificateStore(format!("failed to parse X.509 certificate: {:?}", e))
    })?;

    let needle = name.to_lowercase();
    if needle.is_empty() {
        return Ok(false);
    }

    let cn_match = cert
        .subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .any(|cn| cn.to_lowercase().contains(&needle));
    if cn_match {
        return Ok(true);
    }

    if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
        for general_name in &san_ext.value.general_names {
            if let GeneralName::DNSName(dns) = general_name {
                if dns.to_lowercase().contains(&needle) {
                    return Ok(true);
                }
            }
        }
    }

    Ok(false)
}

/// Whether the certificate's validity period contains the current time
pub fn is_currently_valid(cert_der: &[u8]) -> Result<bool, TransportError> {
    let (_remaining, cert) = x509_parser::parse_x509_certificate(cert_der).map_err(|e| {
        TransportError::CertificateStore(format!("failed to parse X.509 certificate: {:?}", e))
    })?;
    Ok(cert.validity().is_valid())
}

/// Certificate store backed by a directory of PEM files.
///
/// Certificates are read from `*.pem`, `*.crt` and `*.cer` files, scanned in
/// file name order. Only certificates that are currently valid are returned.
/// The private key is taken from the same file if present, otherwise from the
/// sibling `<stem>.key` file.
#[derive(Debug, Clone)]
pub struct PemDirectoryStore {
    dir: PathBuf,
}

impl PemDirectoryStore {
    /// Create a store over `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory searched by this store
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn candidate_files(&self) -> Result<Vec<PathBuf>, TransportError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            TransportError::CertificateStore(format!(
                "failed to open {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_cert = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "pem" | "crt" | "cer"))
                .unwrap_or(false);
            if is_cert {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn load_key(
        &self,
        cert_path: &Path,
        cert_pem: &[u8],
    ) -> Result<PrivateKeyDer<'static>, TransportError> {
        if let Ok(Some(key)) = rustls_pemfile::private_key(&mut &cert_pem[..]) {
            return Ok(key);
        }

        let key_path = cert_path.with_extension("key");
        let key_pem = tokio::fs::read(&key_path).await.map_err(|e| {
            TransportError::CertificateStore(format!(
                "failed to read private key {}: {}",
                key_path.display(),
                e
            ))
        })?;

        rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|e| {
                TransportError::CertificateStore(format!(
                    "failed to parse private key {}: {}",
                    key_path.display(),
                    e
                ))
            })?
            .ok_or_else(|| {
                TransportError::CertificateStore(format!(
                    "no private key found in {}",
                    key_path.display()
                ))
            })
    }
}

#[async_trait]
impl CertificateProvider for PemDirectoryStore {
    async fn certificate(&self, name: &str) -> Result<CertifiedIdentity, TransportError> {
        for path in self.candidate_files().await? {
            let pem = match tokio::fs::read(&path).await {
                Ok(pem) => pem,
                Err(e) => {
                    warn!("Skipping unreadable certificate file {}: {}", path.display(), e);
                    continue;
                }
            };

            let parsed = rustls_pemfile::certs(&mut pem.as_slice()).collect::<Result<Vec<_>, _>>();
            let chain = match parsed {
                Ok(chain) => chain,
                Err(e) => {
                    warn!("Skipping unparsable certificate file {}: {}", path.display(), e);
                    continue;
                }
            };

            let Some(leaf) = chain.first() else {
                continue;
            };

            match subject_matches(leaf, name) {
                Ok(true) if !is_currently_valid(leaf).unwrap_or(false) => {
                    debug!(
                        "Skipping {}: certificate for \"{}\" is outside its validity period",
                        path.display(),
                        name
                    );
                }
                Ok(true) => {
                    let key = self.load_key(&path, &pem).await?;
                    debug!("Resolved certificate \"{}\" from {}", name, path.display());
                    return Ok(CertifiedIdentity::new(chain, key));
                }
                Ok(false) => {}
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }

        Err(TransportError::CertificateNotFound {
            name: name.to_string(),
            store: self.store_name(),
        })
    }

    fn store_name(&self) -> String {
        format!("pem-dir:{}", self.dir.display())
    }
}

/// In-memory certificate store keyed by subject name
#[derive(Debug, Default)]
pub struct MemoryCertificateStore {
    identities: DashMap<String, CertifiedIdentity>,
}

impl MemoryCertificateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `identity` under `name` (case-insensitive)
    pub fn insert(&self, name: &str, identity: CertifiedIdentity) {
        self.identities.insert(name.to_lowercase(), identity);
    }

    /// Remove the identity registered under `name`
    pub fn remove(&self, name: &str) -> bool {
        self.identities.remove(&name.to_lowercase()).is_some()
    }
}

#[async_trait]
impl CertificateProvider for MemoryCertificateStore {
    async fn certificate(&self, name: &str) -> Result<CertifiedIdentity, TransportError> {
        self.identities
            .get(&name.to_lowercase())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::CertificateNotFound {
                name: name.to_string(),
                store: self.store_name(),
            })
    }

    fn store_name(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate(name: &str) -> rcgen::CertifiedKey {
        rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap()
    }

    #[test]
    fn test_subject_matching() {
        let certified = generate("rpc.example.com");
        let der = certified.cert.der();

        assert!(subject_matches(der, "rpc.example.com").unwrap());
        assert!(subject_matches(der, "RPC.Example").unwrap());
        assert!(!subject_matches(der, "other.example.org").unwrap());
        assert!(!subject_matches(der, "").unwrap());
        assert!(subject_matches(&[0x30, 0x00], "x").is_err());
    }

    #[tokio::test]
    async fn test_pem_directory_store() {
        let dir = tempfile::tempdir().unwrap();
        let server = generate("server.rpc.test");
        let other = generate("other.rpc.test");

        std::fs::write(dir.path().join("a-server.pem"), server.cert.pem()).unwrap();
        std::fs::write(dir.path().join("a-server.key"), server.key_pair.serialize_pem()).unwrap();

        // Certificate and key bundled in one file
        let bundle = format!("{}{}", other.cert.pem(), other.key_pair.serialize_pem());
        std::fs::write(dir.path().join("b-other.crt"), bundle).unwrap();

        // Ignored: wrong extension
        std::fs::write(dir.path().join("notes.txt"), "not a certificate").unwrap();

        let store = PemDirectoryStore::new(dir.path());

        let identity = store.certificate("server.rpc.test").await.unwrap();
        assert_eq!(identity.chain()[0].as_ref(), server.cert.der().as_ref());

        let identity = store.certificate("other.rpc.test").await.unwrap();
        assert_eq!(identity.chain()[0].as_ref(), other.cert.der().as_ref());

        let err = store.certificate("missing.rpc.test").await.unwrap_err();
        match err {
            TransportError::CertificateNotFound { name, store } => {
                assert_eq!(name, "missing.rpc.test");
                assert!(store.starts_with("pem-dir:"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_pem_directory_skips_expired() {
        let dir = tempfile::tempdir().unwrap();

        let mut params = rcgen::CertificateParams::new(vec!["svc.rpc.test".to_string()]).unwrap();
        params.not_before = rcgen::date_time_ymd(2000, 1, 1);
        params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        let expired_key = rcgen::KeyPair::generate().unwrap();
        let expired = params.self_signed(&expired_key).unwrap();
        assert!(!is_currently_valid(expired.der()).unwrap());

        let valid = generate("svc.rpc.test");
        assert!(is_currently_valid(valid.cert.der()).unwrap());

        // The expired file sorts first
        let expired_bundle = format!("{}{}", expired.pem(), expired_key.serialize_pem());
        std::fs::write(dir.path().join("a-expired.pem"), expired_bundle).unwrap();
        let valid_bundle = format!("{}{}", valid.cert.pem(), valid.key_pair.serialize_pem());
        std::fs::write(dir.path().join("b-valid.pem"), valid_bundle).unwrap();

        let store = PemDirectoryStore::new(dir.path());
        let identity = store.certificate("svc.rpc.test").await.unwrap();
        assert_eq!(identity.chain()[0].as_ref(), valid.cert.der().as_ref());

        std::fs::remove_file(dir.path().join("b-valid.pem")).unwrap();
        assert!(matches!(
            store.certificate("svc.rpc.test").await,
            Err(TransportError::CertificateNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_pem_directory_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let server = generate("server.rpc.test");
        std::fs::write(dir.path().join("server.pem"), server.cert.pem()).unwrap();

        let store = PemDirectoryStore::new(dir.path());
        let err = store.certificate("server.rpc.test").await.unwrap_err();
        assert!(matches!(err, TransportError::CertificateStore(_)));
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let store = PemDirectoryStore::new("/nonexistent/rpc-certs");
        assert!(matches!(
            store.certificate("any").await,
            Err(TransportError::CertificateStore(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let certified = generate("mem.rpc.test");
        let store = MemoryCertificateStore::new();
        assert!(matches!(
            store.certificate("mem.rpc.test").await,
            Err(TransportError::CertificateNotFound { .. })
        ));

        store.insert(
            "Mem.RPC.test",
            CertifiedIdentity::from_der(
                vec![certified.cert.der().clone()],
                certified.key_pair.serialize_der(),
            ),
        );
        let identity = store.certificate("mem.rpc.test").await.unwrap();
        assert_eq!(identity.chain().len(), 1);

        assert!(store.remove("mem.rpc.test"));
        assert!(!store.remove("mem.rpc.test"));
    }
}
