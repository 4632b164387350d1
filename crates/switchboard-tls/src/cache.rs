use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use rustls::ServerConfig;

pub const DEFAULT_CACHE_CAPACITY: usize = 20_000;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(240 * 60 * 60);

/// One issued hostname's material: the PEM pair handed to callers plus the
/// ready-to-serve rustls config built from it.
#[derive(Clone)]
pub struct CachedLeaf {
    pub cert_pem: String,
    pub key_pem: String,
    pub server_config: Arc<ServerConfig>,
}

struct CacheSlot {
    leaf: CachedLeaf,
    issued_at: Instant,
}

/// Bounded recency cache mapping hostname to issued leaf material.
///
/// Expiry is lazy: a read past the TTL drops the entry and reports it
/// absent; there is no background sweep. A zero TTL disables expiry.
pub struct LeafCache {
    entries: LruCache<String, CacheSlot>,
    ttl: Duration,
}

impl LeafCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    /// A fresh hit refreshes the entry's recency position.
    pub fn get(&mut self, host: &str) -> Option<CachedLeaf> {
        let expired = {
            let slot = self.entries.get(host)?;
            !self.ttl.is_zero() && slot.issued_at.elapsed() > self.ttl
        };
        if expired {
            self.entries.pop(host);
            return None;
        }
        self.entries.get(host).map(|slot| slot.leaf.clone())
    }

    /// Overwrites an existing key (refreshing recency and `issued_at`) or,
    /// on overflow, evicts the single least-recently-used key first.
    pub fn put(&mut self, host: String, leaf: CachedLeaf) {
        self.entries.put(
            host,
            CacheSlot {
                leaf,
                issued_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Peek without touching recency or expiry; test/introspection helper.
    pub fn contains(&self, host: &str) -> bool {
        self.entries.contains(host)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rcgen::{CertificateParams, KeyPair};
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::ServerConfig;

    use super::{CachedLeaf, LeafCache};

    fn test_leaf(tag: &str) -> CachedLeaf {
        let key = KeyPair::generate().expect("generate key");
        let params = CertificateParams::new(vec![format!("{tag}.test")]).expect("params");
        let cert = params.self_signed(&key).expect("self sign");
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![cert.der().clone()],
                PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der())),
            )
            .expect("server config");
        CachedLeaf {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            server_config: Arc::new(server_config),
        }
    }

    #[test]
    fn overflow_evicts_exactly_the_least_recently_used_key() {
        let mut cache = LeafCache::new(3, Duration::ZERO);
        for host in ["a.test", "b.test", "c.test"] {
            cache.put(host.to_string(), test_leaf(host));
        }

        // Touch the oldest entry so "b.test" becomes least recently used.
        assert!(cache.get("a.test").is_some());
        cache.put("d.test".to_string(), test_leaf("d.test"));

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("b.test"));
        for host in ["a.test", "c.test", "d.test"] {
            assert!(cache.contains(host), "expected {host} to survive");
        }
    }

    #[test]
    fn hit_returns_the_same_pem_material() {
        let mut cache = LeafCache::new(4, Duration::from_secs(3600));
        let leaf = test_leaf("a");
        cache.put("a.test".to_string(), leaf.clone());

        let first = cache.get("a.test").expect("first read");
        let second = cache.get("a.test").expect("second read");
        assert_eq!(first.cert_pem, leaf.cert_pem);
        assert_eq!(first.key_pem, second.key_pem);
        assert!(Arc::ptr_eq(&first.server_config, &second.server_config));
    }

    #[test]
    fn expired_entry_reads_as_absent_and_is_dropped() {
        let mut cache = LeafCache::new(4, Duration::from_millis(30));
        cache.put("a.test".to_string(), test_leaf("a"));
        assert!(cache.get("a.test").is_some());

        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get("a.test").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_ttl_disables_expiry() {
        let mut cache = LeafCache::new(4, Duration::ZERO);
        cache.put("a.test".to_string(), test_leaf("a"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("a.test").is_some());
    }

    #[test]
    fn overwrite_refreshes_recency() {
        let mut cache = LeafCache::new(2, Duration::ZERO);
        cache.put("a.test".to_string(), test_leaf("a"));
        cache.put("b.test".to_string(), test_leaf("b"));
        cache.put("a.test".to_string(), test_leaf("a2"));
        cache.put("c.test".to_string(), test_leaf("c"));

        assert!(cache.contains("a.test"));
        assert!(!cache.contains("b.test"));
        assert!(cache.contains("c.test"));
    }
}
