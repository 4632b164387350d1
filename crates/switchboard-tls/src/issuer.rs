use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration as ValidityWindow, OffsetDateTime};

use crate::authority::RootAuthority;
use crate::cache::{CachedLeaf, LeafCache};
use crate::{normalize_host, TlsError};

/// Validity extends 20 days on both sides of issuance: tolerant of
/// client/proxy clock skew, and short-lived because leaves are regenerated
/// by cache TTL rather than trusted long term.
const LEAF_VALIDITY_DAYS: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafCacheStatus {
    Hit,
    Miss,
}

impl LeafCacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
        }
    }
}

/// What `issue` hands back: the PEM pair plus a server config ready for a
/// handshake with that hostname.
#[derive(Debug)]
pub struct IssuedLeaf {
    pub cert_pem: String,
    pub key_pem: String,
    pub server_config: Arc<ServerConfig>,
    pub cache_status: LeafCacheStatus,
}

impl IssuedLeaf {
    fn from_cached(leaf: CachedLeaf, cache_status: LeafCacheStatus) -> Self {
        Self {
            cert_pem: leaf.cert_pem,
            key_pem: leaf.key_pem,
            server_config: leaf.server_config,
            cache_status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IssuerMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
}

/// Issues leaf certificates signed by the root authority, caching results
/// per hostname.
///
/// Key generation and signing are CPU-bound, so cache misses run on the
/// blocking pool instead of stalling the async scheduler. Concurrent
/// first-time requests for the same hostname are single-flighted: the
/// second caller waits and then reads the first caller's cache entry.
pub struct CertificateIssuer {
    authority: Option<Arc<RootAuthority>>,
    cache: Mutex<LeafCache>,
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
}

impl CertificateIssuer {
    pub fn new(authority: Option<Arc<RootAuthority>>, capacity: usize, ttl: Duration) -> Self {
        Self {
            authority,
            cache: Mutex::new(LeafCache::new(capacity, ttl)),
            inflight: Mutex::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
        }
    }

    pub fn has_authority(&self) -> bool {
        self.authority.is_some()
    }

    pub fn authority(&self) -> Option<&Arc<RootAuthority>> {
        self.authority.as_ref()
    }

    pub async fn issue(&self, hostname: &str) -> Result<IssuedLeaf, TlsError> {
        let host = normalize_host(hostname);
        if let Some(leaf) = self.cached(&host)? {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(IssuedLeaf::from_cached(leaf, LeafCacheStatus::Hit));
        }

        let flight = self.flight(&host)?;
        let _issuing = flight.lock().await;
        if let Some(leaf) = self.cached(&host)? {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(IssuedLeaf::from_cached(leaf, LeafCacheStatus::Hit));
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let authority = self
            .authority
            .clone()
            .ok_or(TlsError::RootCaNotLoaded)?;
        let issue_host = host.clone();
        let leaf = tokio::task::spawn_blocking(move || issue_leaf(&authority, &issue_host))
            .await
            .map_err(|error| TlsError::IssuanceTask(error.to_string()))??;

        self.cache
            .lock()
            .map_err(|_| TlsError::LockPoisoned)?
            .put(host.clone(), leaf.clone());
        self.leaves_issued.fetch_add(1, Ordering::Relaxed);
        self.clear_flight(&host);

        Ok(IssuedLeaf::from_cached(leaf, LeafCacheStatus::Miss))
    }

    pub fn metrics_snapshot(&self) -> IssuerMetricsSnapshot {
        IssuerMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
        }
    }

    fn cached(&self, host: &str) -> Result<Option<CachedLeaf>, TlsError> {
        Ok(self
            .cache
            .lock()
            .map_err(|_| TlsError::LockPoisoned)?
            .get(host))
    }

    fn flight(&self, host: &str) -> Result<Arc<tokio::sync::Mutex<()>>, TlsError> {
        let mut inflight = self.inflight.lock().map_err(|_| TlsError::LockPoisoned)?;
        Ok(Arc::clone(
            inflight
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        ))
    }

    fn clear_flight(&self, host: &str) {
        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.remove(host);
        }
    }
}

fn issue_leaf(authority: &RootAuthority, host: &str) -> Result<CachedLeaf, TlsError> {
    let params = build_leaf_params(host)?;
    let key = generate_leaf_key()?;
    let cert = params.signed_by(&key, authority.issuer())?;

    let chain = vec![cert.der().clone(), authority.cert_der().clone()];
    let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der()));
    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, private_key)?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(CachedLeaf {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        server_config: Arc::new(server_config),
    })
}

fn build_leaf_params(host: &str) -> Result<CertificateParams, TlsError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.serial_number = Some(random_serial());

    let now = OffsetDateTime::now_utc();
    params.not_before = now - ValidityWindow::days(LEAF_VALIDITY_DAYS);
    params.not_after = now + ValidityWindow::days(LEAF_VALIDITY_DAYS);

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DataEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, host.to_string());
    params.distinguished_name = distinguished_name;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?));
    }

    Ok(params)
}

/// RSA-2048 when the crypto backend can generate it, ECDSA P-256 otherwise.
fn generate_leaf_key() -> Result<KeyPair, TlsError> {
    KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
        .or_else(|_| KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256))
        .map_err(Into::into)
}

/// 16 random bytes reinterpreted as a positive integer: a leading zero byte
/// is prepended when the top bit is set, keeping the DER encoding
/// non-negative.
fn random_serial() -> SerialNumber {
    let mut bytes = vec![0_u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    if bytes[0] & 0x80 != 0 {
        bytes.insert(0, 0);
    }
    SerialNumber::from(bytes)
}
