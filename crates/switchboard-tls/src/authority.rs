use std::fs;
use std::path::Path;

use rcgen::{Issuer, KeyPair};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;

use crate::TlsError;

/// The private root certificate/key pair that signs every issued leaf.
/// Loaded once at startup and immutable for the process lifetime; when
/// loading fails the engine runs without it and TLS interception fails
/// per-connection instead.
#[derive(Debug)]
pub struct RootAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    key_pem: String,
}

impl RootAuthority {
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let cert_pem = fs::read_to_string(cert_path).map_err(|error| {
            TlsError::AuthorityUnavailable(format!(
                "failed to read root certificate {}: {error}",
                cert_path.display()
            ))
        })?;
        let key_pem = fs::read_to_string(key_path).map_err(|error| {
            TlsError::AuthorityUnavailable(format!(
                "failed to read root private key {}: {error}",
                key_path.display()
            ))
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, TlsError> {
        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
            TlsError::AuthorityUnavailable(format!("failed to parse root certificate PEM: {error}"))
        })?;
        let key = KeyPair::from_pem(key_pem).map_err(|error| {
            TlsError::AuthorityUnavailable(format!("failed to parse root private key PEM: {error}"))
        })?;
        let issuer = Issuer::from_ca_cert_der(&cert_der, key).map_err(|error| {
            TlsError::AuthorityUnavailable(format!(
                "failed to derive issuer metadata from root certificate: {error}"
            ))
        })?;

        Ok(Self {
            issuer,
            cert_pem: cert_pem.to_string(),
            cert_der,
            key_pem: key_pem.to_string(),
        })
    }

    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }
}
