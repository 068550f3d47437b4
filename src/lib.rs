//! vpki - TLS servers with short-lived certificates issued on demand
//!
//! This library re-exports the vpki crates, providing a single entry point for
//! applications that serve HTTPS with certificates from a PKI backend.
//!
//! # Quick Start
//!
//! ```ignore
//! use vpki::{listen_and_serve_tls, SignerCapability, VaultConfig, VaultSigner};
//! use axum::{routing::get, Router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let signer = VaultSigner::new(VaultConfig::from_env())?;
//!     let app = Router::new().route("/", get(|| async { "hello" }));
//!
//!     listen_and_serve_tls("0.0.0.0:443".parse()?, app, SignerCapability::issue(signer)).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Signers
//!
//! - [`VaultSigner`]: signs CSRs through Vault's PKI secrets engine
//! - [`LocalCa`]: in-process certificate authority, for development and tests
//! - any type implementing [`Signer`] (cached per host name) or
//!   [`HandshakeSigner`] (consulted on every handshake)

// Certificate material and signers
pub use vpki_cert::{
    Certificate, CertificateEntry, CertificateError, ClientHelloInfo, HandshakeSigner, LocalCa,
    RawPair, Signer, SignerCapability, SignerError, Validity, VaultConfig, VaultSigner,
    DEFAULT_KEY_STRENGTH, DEFAULT_TTL,
};

// TLS serving
pub use vpki_server_tls::{
    listen_and_serve_tls, CacheConfig, CertErrorCounter, CertSelectionError, CertificateCache,
    CertificateSelector, Clock, ManualClock, PrometheusCertErrors, SystemClock, TlsServer,
    TlsServerConfig, TlsServerError, CERT_ERROR_METRIC,
};
