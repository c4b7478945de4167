//! TLS certificates and revocation lists
//!
//! Key pairs and CRLs are held in one immutable generation behind a lock
//! that is only taken to clone or swap the pointer. A reload builds a
//! complete new generation off to the side and installs it only if every
//! file loaded, so handshakes always see either the old or the new set.

use chrono::{DateTime, Utc};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

use crate::audit::AuditEvent;
use crate::config::{KeyPairConfig, TlsConfig};
use crate::{Error, Result};

/// Key pair id used when no SNI name matches
pub const DEFAULT_KEY_PAIR_ID: &str = "default";

/// A certificate chain and its signing key, ready to serve
pub struct LoadedKeyPair {
    id: String,
    certified: Arc<CertifiedKey>,
    names: Vec<String>,
    fingerprint: String,
    not_after: Option<DateTime<Utc>>,
    loaded_at: DateTime<Utc>,
}

impl fmt::Debug for LoadedKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedKeyPair")
            .field("id", &self.id)
            .field("names", &self.names)
            .field("fingerprint", &self.fingerprint)
            .field("not_after", &self.not_after)
            .field("loaded_at", &self.loaded_at)
            .finish_non_exhaustive()
    }
}

impl LoadedKeyPair {
    /// Configured identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Chain and key handed to rustls
    pub const fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified
    }

    /// DNS names and common name of the leaf, lowercased
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// SHA-256 of the leaf certificate, hex encoded
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Leaf expiry
    pub const fn not_after(&self) -> Option<DateTime<Utc>> {
        self.not_after
    }

    /// When this key pair was read from disk
    pub const fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    fn matches(&self, server_name: &str) -> bool {
        self.names
            .iter()
            .any(|name| name_matches(name, server_name))
    }
}

/// A parsed certificate revocation list
#[derive(Debug)]
pub struct RevocationList {
    source: PathBuf,
    issuer: Vec<u8>,
    issuer_name: String,
    serials: HashSet<Vec<u8>>,
    next_update: Option<DateTime<Utc>>,
}

impl RevocationList {
    /// File the list was read from
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Issuer distinguished name
    pub fn issuer(&self) -> &str {
        &self.issuer_name
    }

    /// Number of revoked serials
    pub fn len(&self) -> usize {
        self.serials.len()
    }

    /// True when nothing is revoked
    pub fn is_empty(&self) -> bool {
        self.serials.is_empty()
    }

    /// Time the issuer promised a newer list by
    pub const fn next_update(&self) -> Option<DateTime<Utc>> {
        self.next_update
    }

    /// Whether `next_update` has passed
    pub fn is_stale(&self) -> bool {
        self.next_update.is_some_and(|next| next < Utc::now())
    }

    fn revokes(&self, issuer: &[u8], serial: &[u8]) -> bool {
        self.issuer == issuer && self.serials.contains(trim_serial(serial))
    }
}

#[derive(Debug)]
struct Generation {
    key_pairs: Vec<Arc<LoadedKeyPair>>,
    revocation_lists: Vec<Arc<RevocationList>>,
}

/// Files a generation is loaded from
#[derive(Debug, Default)]
struct Sources {
    key_pairs: Vec<KeyPairConfig>,
    revocation_lists: Vec<PathBuf>,
}

/// Process-wide store of key pairs and revocation lists
///
/// Every change to the generation happens while holding `sources`, so
/// concurrent loads and reloads never install a mix of stale halves.
pub struct CertManager {
    sources: Mutex<Sources>,
    generation: RwLock<Arc<Generation>>,
}

impl fmt::Debug for CertManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let generation = self.current();
        f.debug_struct("CertManager")
            .field("key_pairs", &generation.key_pairs.len())
            .field("revocation_lists", &generation.revocation_lists.len())
            .finish()
    }
}

impl Default for CertManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CertManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self {
            sources: Mutex::new(Sources::default()),
            generation: RwLock::new(Arc::new(Generation {
                key_pairs: Vec::new(),
                revocation_lists: Vec::new(),
            })),
        }
    }

    /// Create a manager and load everything the TLS section names
    ///
    /// # Errors
    ///
    /// The first certificate, key or CRL that fails to load
    pub fn from_config(config: &TlsConfig) -> Result<Self> {
        let manager = Self::new();
        manager.load_key_pairs(config.certificates.clone())?;
        manager.set_revocation_lists(config.revocation_lists.clone())?;
        Ok(manager)
    }

    fn current(&self) -> Arc<Generation> {
        Arc::clone(
            &self
                .generation
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    fn lock_sources(&self) -> MutexGuard<'_, Sources> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swap in a new generation; callers hold the sources lock.
    fn install(&self, _sources: &Sources, generation: Generation) {
        *self
            .generation
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(generation);
    }

    /// Replace the key pairs
    ///
    /// Every pair is loaded before anything is swapped in; on error the
    /// previous key pairs stay in force.
    ///
    /// # Errors
    ///
    /// `Error::Certificate` for the first pair that fails to load
    pub fn load_key_pairs(&self, pairs: Vec<KeyPairConfig>) -> Result<()> {
        let mut sources = self.lock_sources();
        let key_pairs = load_all_key_pairs(&pairs)?;
        let revocation_lists = self.current().revocation_lists.clone();
        info!(key_pairs = key_pairs.len(), "TLS key pairs loaded");
        self.install(
            &sources,
            Generation {
                key_pairs,
                revocation_lists,
            },
        );
        sources.key_pairs = pairs;
        Ok(())
    }

    /// Replace the revocation-list sources and load them
    ///
    /// # Errors
    ///
    /// `Error::Certificate` for the first list that fails to load; the
    /// previous lists stay in force
    pub fn set_revocation_lists(&self, paths: Vec<PathBuf>) -> Result<()> {
        let mut sources = self.lock_sources();
        let revocation_lists = load_all_crls(&paths)?;
        let key_pairs = self.current().key_pairs.clone();
        info!(
            revocation_lists = revocation_lists.len(),
            "Revocation lists loaded"
        );
        self.install(
            &sources,
            Generation {
                key_pairs,
                revocation_lists,
            },
        );
        sources.revocation_lists = paths;
        Ok(())
    }

    /// Re-read every configured certificate, key and revocation list
    ///
    /// The new generation is installed only if all of them load.
    ///
    /// # Errors
    ///
    /// The first load error; the running generation is untouched
    pub fn reload(&self) -> Result<()> {
        let sources = self.lock_sources();
        let loaded = load_all_key_pairs(&sources.key_pairs)
            .and_then(|key_pairs| Ok((key_pairs, load_all_crls(&sources.revocation_lists)?)));

        match loaded {
            Ok((key_pairs, revocation_lists)) => {
                AuditEvent::CertificatesReloaded {
                    key_pairs: key_pairs.len(),
                    revocation_lists: revocation_lists.len(),
                    success: true,
                    error: None,
                    timestamp: Utc::now(),
                }
                .log();
                self.install(
                    &sources,
                    Generation {
                        key_pairs,
                        revocation_lists,
                    },
                );
                Ok(())
            }
            Err(e) => {
                AuditEvent::CertificatesReloaded {
                    key_pairs: sources.key_pairs.len(),
                    revocation_lists: sources.revocation_lists.len(),
                    success: false,
                    error: Some(e.to_string()),
                    timestamp: Utc::now(),
                }
                .log();
                Err(e)
            }
        }
    }

    /// Certificate to present for a server name
    ///
    /// Matches DNS names and the common name of every key pair, including
    /// `*.` wildcards. Without a match, the `default` key pair is used, or
    /// the first one loaded.
    pub fn get_certificate(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let generation = self.current();
        let matched = server_name.and_then(|name| {
            let name = name.trim_end_matches('.').to_ascii_lowercase();
            generation.key_pairs.iter().find(|pair| pair.matches(&name))
        });
        let pair = matched
            .or_else(|| {
                generation
                    .key_pairs
                    .iter()
                    .find(|pair| pair.id == DEFAULT_KEY_PAIR_ID)
            })
            .or_else(|| generation.key_pairs.first())?;

        debug!(server_name = ?server_name, key_pair = %pair.id, "Selected certificate");
        Some(Arc::clone(&pair.certified))
    }

    /// A key pair by id
    pub fn key_pair(&self, id: &str) -> Option<Arc<LoadedKeyPair>> {
        self.current()
            .key_pairs
            .iter()
            .find(|pair| pair.id == id)
            .cloned()
    }

    /// Every loaded key pair
    pub fn key_pairs(&self) -> Vec<Arc<LoadedKeyPair>> {
        self.current().key_pairs.clone()
    }

    /// Every loaded revocation list
    pub fn revocation_lists(&self) -> Vec<Arc<RevocationList>> {
        self.current().revocation_lists.clone()
    }

    /// Check a client's verified chains against the revocation lists
    ///
    /// A certificate is revoked when a loaded list issued by its issuer
    /// names its serial. The peer certificate is checked even when it is
    /// not the first link of a chain.
    ///
    /// # Errors
    ///
    /// `NoVerifiedChain` when there is no chain or a chain is empty,
    /// `CertificateRevoked` for the first revoked certificate,
    /// `Certificate` when a certificate cannot be parsed
    pub fn verify_chain(
        &self,
        peer: Option<&CertificateDer<'_>>,
        verified_chains: &[Vec<CertificateDer<'_>>],
    ) -> Result<()> {
        if verified_chains.is_empty() || verified_chains.iter().any(Vec::is_empty) {
            AuditEvent::CertificateRejected {
                subject: None,
                reason: Error::NoVerifiedChain.to_string(),
                timestamp: Utc::now(),
            }
            .log();
            return Err(Error::NoVerifiedChain);
        }

        let generation = self.current();
        if generation.revocation_lists.is_empty() {
            return Ok(());
        }

        let chain_certs = verified_chains.iter().flatten();
        for der in peer.into_iter().chain(chain_certs) {
            let (_, cert) = X509Certificate::from_der(der.as_ref())
                .map_err(|e| Error::Certificate(format!("unparsable peer certificate: {}", e)))?;
            let issuer = cert.issuer().as_raw();
            let serial = cert.raw_serial();

            if let Some(crl) = generation
                .revocation_lists
                .iter()
                .find(|crl| crl.revokes(issuer, serial))
            {
                let subject = cert.subject().to_string();
                let reason = format!(
                    "serial {} listed by {}",
                    hex::encode(trim_serial(serial)),
                    crl.issuer_name
                );
                AuditEvent::CertificateRejected {
                    subject: Some(subject.clone()),
                    reason: reason.clone(),
                    timestamp: Utc::now(),
                }
                .log();
                return Err(Error::CertificateRevoked(format!("{}: {}", subject, reason)));
            }
        }
        Ok(())
    }

    /// Build a rustls server configuration backed by this manager
    ///
    /// Certificates are resolved per handshake, so reloads apply to new
    /// connections immediately. With `client_ca` set, clients must present
    /// a certificate signed by one of its authorities.
    ///
    /// # Errors
    ///
    /// `Error::Certificate` if the client CA bundle cannot be loaded
    pub fn server_config(self: &Arc<Self>, client_ca: Option<&Path>) -> Result<ServerConfig> {
        let builder = ServerConfig::builder();
        let config = match client_ca {
            Some(path) => {
                let mut roots = rustls::RootCertStore::empty();
                for cert in read_certs(path)? {
                    roots.add(cert).map_err(|e| {
                        Error::Certificate(format!("invalid CA in {}: {}", path.display(), e))
                    })?;
                }
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|e| Error::Certificate(format!("client verifier: {}", e)))?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_cert_resolver(Arc::clone(self) as Arc<dyn ResolvesServerCert>)
            }
            None => builder
                .with_no_client_auth()
                .with_cert_resolver(Arc::clone(self) as Arc<dyn ResolvesServerCert>),
        };
        Ok(config)
    }
}

impl ResolvesServerCert for CertManager {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.get_certificate(client_hello.server_name())
    }
}

fn name_matches(pattern: &str, server_name: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => server_name
            .split_once('.')
            .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
        None => pattern == server_name,
    }
}

fn trim_serial(serial: &[u8]) -> &[u8] {
    let start = serial
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(serial.len().saturating_sub(1));
    &serial[start..]
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::Certificate(format!("failed to open {}: {}", path.display(), e)))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut open(path)?)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| {
            Error::Certificate(format!("failed to parse certificate {}: {}", path.display(), e))
        })?;
    if certs.is_empty() {
        return Err(Error::Certificate(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| {
            Error::Certificate(format!("failed to parse private key {}: {}", path.display(), e))
        })?
        .ok_or_else(|| Error::Certificate(format!("no private key found in {}", path.display())))
}

fn load_key_pair(config: &KeyPairConfig) -> Result<LoadedKeyPair> {
    let chain = read_certs(&config.cert_path)?;
    let key = read_key(&config.key_path)?;
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key).map_err(|e| {
        Error::Certificate(format!(
            "unsupported private key {}: {}",
            config.key_path.display(),
            e
        ))
    })?;

    let leaf = &chain[0];
    let (_, parsed) = X509Certificate::from_der(leaf.as_ref()).map_err(|e| {
        Error::Certificate(format!(
            "failed to parse certificate {}: {}",
            config.cert_path.display(),
            e
        ))
    })?;

    let mut names: Vec<String> = parsed
        .subject_alternative_name()
        .ok()
        .flatten()
        .map(|san| {
            san.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_ascii_lowercase()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    for cn in parsed.subject().iter_common_name() {
        if let Ok(cn) = cn.as_str() {
            let cn = cn.to_ascii_lowercase();
            if !names.contains(&cn) {
                names.push(cn);
            }
        }
    }

    let not_after = DateTime::from_timestamp(parsed.validity().not_after.timestamp(), 0);
    if not_after.is_some_and(|expiry| expiry < Utc::now()) {
        warn!(
            key_pair = %config.id,
            cert_path = %config.cert_path.display(),
            "Certificate has expired"
        );
    }

    let fingerprint = hex::encode(Sha256::digest(leaf.as_ref()));
    debug!(key_pair = %config.id, fingerprint = %fingerprint, names = ?names, "Key pair loaded");

    Ok(LoadedKeyPair {
        id: config.id.clone(),
        certified: Arc::new(CertifiedKey::new(chain, signing_key)),
        names,
        fingerprint,
        not_after,
        loaded_at: Utc::now(),
    })
}

fn load_all_key_pairs(configs: &[KeyPairConfig]) -> Result<Vec<Arc<LoadedKeyPair>>> {
    configs
        .iter()
        .map(|config| load_key_pair(config).map(Arc::new))
        .collect()
}

fn read_crl_ders(path: &Path) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    let content = std::fs::read(path)
        .map_err(|e| Error::Certificate(format!("failed to read {}: {}", path.display(), e)))?;
    if !content.starts_with(b"-----BEGIN") {
        return Ok(vec![CertificateRevocationListDer::from(content)]);
    }
    let ders: Vec<_> = rustls_pemfile::crls(&mut content.as_slice())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| {
            Error::Certificate(format!("failed to parse CRL {}: {}", path.display(), e))
        })?;
    if ders.is_empty() {
        return Err(Error::Certificate(format!(
            "no revocation list found in {}",
            path.display()
        )));
    }
    Ok(ders)
}

fn load_crls(path: &Path) -> Result<Vec<RevocationList>> {
    let mut lists = Vec::new();
    for der in read_crl_ders(path)? {
        let (_, crl) = x509_parser::parse_x509_crl(der.as_ref()).map_err(|e| {
            Error::Certificate(format!("failed to parse CRL {}: {}", path.display(), e))
        })?;

        let list = RevocationList {
            source: path.to_path_buf(),
            issuer: crl.issuer().as_raw().to_vec(),
            issuer_name: crl.issuer().to_string(),
            serials: crl
                .iter_revoked_certificates()
                .map(|revoked| trim_serial(revoked.raw_serial()).to_vec())
                .collect(),
            next_update: crl
                .next_update()
                .and_then(|next| DateTime::from_timestamp(next.timestamp(), 0)),
        };
        if list.is_stale() {
            warn!(
                event = "stale_crl",
                source = %path.display(),
                issuer = %list.issuer_name,
                next_update = ?list.next_update,
                "Revocation list is past its next update, still applying it"
            );
        }
        lists.push(list);
    }
    Ok(lists)
}

fn load_all_crls(sources: &[PathBuf]) -> Result<Vec<Arc<RevocationList>>> {
    let mut lists = Vec::new();
    for source in sources {
        lists.extend(load_crls(source)?.into_iter().map(Arc::new));
    }
    Ok(lists)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_matching() {
        assert!(name_matches("files.example.com", "files.example.com"));
        assert!(!name_matches("files.example.com", "example.com"));
        assert!(name_matches("*.example.com", "a.example.com"));
        assert!(!name_matches("*.example.com", "a.b.example.com"));
        assert!(!name_matches("*.example.com", "example.com"));
        assert!(!name_matches("*.example.com", ".example.com"));
    }

    #[test]
    fn test_trim_serial() {
        assert_eq!(trim_serial(&[0, 0, 0x75, 0x1f]), &[0x75, 0x1f]);
        assert_eq!(trim_serial(&[0x01]), &[0x01]);
        assert_eq!(trim_serial(&[0]), &[0]);
    }

    #[test]
    fn test_empty_manager() {
        let manager = CertManager::new();
        assert!(manager.get_certificate(Some("example.com")).is_none());
        assert!(manager.key_pairs().is_empty());
        assert!(manager.reload().is_ok());
    }

    #[test]
    fn test_missing_chain_is_rejected_first() {
        let manager = CertManager::new();
        assert!(matches!(
            manager.verify_chain(None, &[]),
            Err(Error::NoVerifiedChain)
        ));
        assert!(matches!(
            manager.verify_chain(None, &[Vec::new()]),
            Err(Error::NoVerifiedChain)
        ));
    }
}
