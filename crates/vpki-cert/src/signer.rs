//! The signing seam: anything that can turn a host name into a certificate

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::server::ClientHello;
use rustls::{CipherSuite, SignatureScheme};
use thiserror::Error;

use crate::{Certificate, CertificateError};

/// Default lifetime requested for leaf certificates
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default key strength (ECDSA curve size in bits)
pub const DEFAULT_KEY_STRENGTH: u32 = 256;

/// Signer errors
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("{addr} returned an error: {reason}")]
    Backend { addr: String, reason: String },

    #[error("Signing request rejected: {0}")]
    Rejected(String),

    #[error("Invalid host name: {0}")]
    InvalidHostName(String),

    #[error("Unsupported key strength: {0}")]
    UnsupportedKeyStrength(u32),

    #[error("Invalid validity window: {0}")]
    InvalidValidity(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),
}

impl From<rcgen::Error> for SignerError {
    fn from(e: rcgen::Error) -> Self {
        SignerError::KeyGeneration(e.to_string())
    }
}

/// Produces signed certificates for host names
///
/// Implementations may be a remote PKI, a local CA or a test double. Calls
/// must be safe to run concurrently, for the same host name too.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Issue a certificate for `host_name` valid for `ttl`
    async fn issue(
        &self,
        host_name: &str,
        ttl: Duration,
        key_strength: u32,
    ) -> Result<Certificate, SignerError>;
}

#[async_trait]
impl<S: Signer + ?Sized> Signer for Arc<S> {
    async fn issue(
        &self,
        host_name: &str,
        ttl: Duration,
        key_strength: u32,
    ) -> Result<Certificate, SignerError> {
        (**self).issue(host_name, ttl, key_strength).await
    }
}

/// Owned view of a TLS ClientHello
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHelloInfo {
    /// SNI host name, `None` when the client did not send one
    pub server_name: Option<String>,
    pub alpn_protocols: Vec<Vec<u8>>,
    pub signature_schemes: Vec<SignatureScheme>,
    pub cipher_suites: Vec<CipherSuite>,
}

impl ClientHelloInfo {
    pub fn from_client_hello(hello: &ClientHello<'_>) -> Self {
        Self {
            server_name: hello.server_name().map(str::to_string),
            alpn_protocols: hello
                .alpn()
                .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
                .unwrap_or_default(),
            signature_schemes: hello.signature_schemes().to_vec(),
            cipher_suites: hello.cipher_suites().to_vec(),
        }
    }

    /// Hello carrying only an SNI name
    pub fn for_server_name(server_name: impl Into<String>) -> Self {
        Self {
            server_name: Some(server_name.into()),
            ..Default::default()
        }
    }

    /// Requested host name, empty when SNI was omitted
    pub fn server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or("")
    }
}

/// Signer that picks a certificate from the full handshake information
///
/// Used when the signer wants complete control, e.g. it caches internally
/// or follows a different trust scheme. Certificates it returns bypass the
/// host-name cache.
#[async_trait]
pub trait HandshakeSigner: Send + Sync {
    async fn select_certificate(&self, hello: &ClientHelloInfo)
        -> Result<Certificate, SignerError>;
}

/// How a server obtains certificates, fixed at configuration time
#[derive(Clone)]
pub enum SignerCapability {
    /// Issue per host name and cache until expiry
    Issue(Arc<dyn Signer>),
    /// Hand every handshake to the signer, no caching
    Select(Arc<dyn HandshakeSigner>),
}

impl SignerCapability {
    pub fn issue(signer: impl Signer + 'static) -> Self {
        SignerCapability::Issue(Arc::new(signer))
    }

    pub fn select(signer: impl HandshakeSigner + 'static) -> Self {
        SignerCapability::Select(Arc::new(signer))
    }
}

impl std::fmt::Debug for SignerCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignerCapability::Issue(_) => f.write_str("SignerCapability::Issue"),
            SignerCapability::Select(_) => f.write_str("SignerCapability::Select"),
        }
    }
}
