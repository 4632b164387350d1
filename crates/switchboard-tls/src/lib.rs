//! Certificate machinery for TLS interception: loading the private root
//! authority, issuing per-hostname leaf certificates on demand, and caching
//! the issued material for the lifetime of the process.

use std::net::IpAddr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use thiserror::Error;

mod authority;
mod cache;
mod issuer;

pub use authority::RootAuthority;
pub use cache::{CachedLeaf, LeafCache, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};
pub use issuer::{CertificateIssuer, IssuedLeaf, IssuerMetricsSnapshot, LeafCacheStatus};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("root certificate authority is not loaded")]
    RootCaNotLoaded,
    #[error("root certificate authority unavailable: {0}")]
    AuthorityUnavailable(String),
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("certificate issuance task failed: {0}")]
    IssuanceTask(String),
    #[error("certificate store lock poisoned")]
    LockPoisoned,
}

/// Client-side TLS configuration for upstream connections. The engine
/// forwards to arbitrary rewritten targets whose certificates rarely match
/// the original hostname, so verification is skipped by default; with
/// verification on, the webpki root store applies.
pub fn upstream_client_config(insecure_skip_verify: bool) -> Arc<ClientConfig> {
    let mut config = if insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(UnverifiedUpstreamCertVerifier))
            .with_no_client_auth()
    } else {
        let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Hostnames are cached case-insensitively; IP literals keep their spelling.
pub fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

#[derive(Debug)]
struct UnverifiedUpstreamCertVerifier;

impl ServerCertVerifier for UnverifiedUpstreamCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}


#[cfg(test)]
mod tests {
    use super::{normalize_host, upstream_client_config};

    #[test]
    fn normalizes_dns_names_but_not_ip_literals() {
        assert_eq!(normalize_host("API.Example.COM"), "api.example.com");
        assert_eq!(normalize_host("127.0.0.1"), "127.0.0.1");
        assert_eq!(normalize_host("2001:DB8::1"), "2001:DB8::1");
    }

    #[test]
    fn client_configs_advertise_http1() {
        let verified = upstream_client_config(false);
        assert_eq!(verified.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let unverified = upstream_client_config(true);
        assert_eq!(unverified.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
