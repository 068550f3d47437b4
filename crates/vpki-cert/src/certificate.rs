//! Certificate material and the parsed, TLS-ready cache entry built from it

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

/// Errors raised while turning signer output into usable certificate material
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Certificate chain is empty")]
    EmptyChain,

    #[error("Failed to parse leaf certificate: {0}")]
    Parse(String),

    #[error("Private key does not match the leaf certificate")]
    KeyMismatch,

    #[error("Unsupported private key: {0}")]
    UnsupportedKey(String),

    #[error("PEM error: {0}")]
    Pem(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Certificate with private key, leaf first in `cert_chain`
#[derive(Debug)]
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Clone for Certificate {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
        }
    }
}

impl Certificate {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }

    /// Parse a PEM certificate chain and a PEM private key
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, CertificateError> {
        let cert_chain = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertificateError::Pem(format!("Failed to parse certificate: {}", e)))?;

        if cert_chain.is_empty() {
            return Err(CertificateError::EmptyChain);
        }

        let private_key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| CertificateError::Pem(format!("Failed to parse private key: {}", e)))?
            .ok_or_else(|| CertificateError::Pem("No private key found".to_string()))?;

        Ok(Self {
            cert_chain,
            private_key,
        })
    }

    /// Load certificate from PEM files
    pub async fn load_from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, CertificateError> {
        let cert_pem = fs::read(cert_path.as_ref()).await?;
        let key_pem = fs::read(key_path.as_ref()).await?;

        let certificate = Self::from_pem(&cert_pem, &key_pem)?;

        debug!(
            "Certificate loaded from {} and {}",
            cert_path.as_ref().display(),
            key_path.as_ref().display()
        );

        Ok(certificate)
    }

    /// The end-entity certificate
    pub fn leaf(&self) -> Result<&CertificateDer<'static>, CertificateError> {
        self.cert_chain.first().ok_or(CertificateError::EmptyChain)
    }
}

/// Validity window of a leaf certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl Validity {
    /// Read the validity window out of a DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self, CertificateError> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| CertificateError::Parse(e.to_string()))?;

        let validity = cert.validity();
        let not_before = timestamp(validity.not_before.timestamp())?;
        let not_after = timestamp(validity.not_after.timestamp())?;

        Ok(Self {
            not_before,
            not_after,
        })
    }

    /// `not_before <= now < not_after`
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, CertificateError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| CertificateError::Parse(format!("Timestamp out of range: {}", secs)))
}

/// One issued certificate bound to a host name
///
/// Entries are immutable; a reissue produces a new entry that replaces the
/// old one in the cache.
#[derive(Debug, Clone)]
pub struct CertificateEntry {
    host_name: String,
    validity: Validity,
    certified_key: Arc<CertifiedKey>,
    certificate: Certificate,
}

impl CertificateEntry {
    /// Validate signer output and build the rustls signing material for it
    pub fn new(
        host_name: impl Into<String>,
        certificate: Certificate,
    ) -> Result<Self, CertificateError> {
        let validity = Validity::from_der(certificate.leaf()?)?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&certificate.private_key)
            .map_err(|e| CertificateError::UnsupportedKey(e.to_string()))?;

        let certified_key = CertifiedKey::new(certificate.cert_chain.clone(), signing_key);
        match certified_key.keys_match() {
            Ok(()) | Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::Unknown)) => {}
            Err(_) => return Err(CertificateError::KeyMismatch),
        }

        Ok(Self {
            host_name: host_name.into(),
            validity,
            certified_key: Arc::new(certified_key),
            certificate,
        })
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.validity.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.validity.not_after
    }

    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.validity.is_fresh_at(now)
    }

    /// Key and chain ready to hand to rustls
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.certified_key.clone()
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }
}
