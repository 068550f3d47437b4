//! TLS serving with certificates issued on demand
//!
//! Certificates are requested from a `Signer` the first time a host name is
//! seen through SNI, cached until they expire, and reissued when stale.
pub mod cache;
pub mod clock;
pub mod error;
pub mod metrics;
pub mod selector;
pub mod server;

#[cfg(test)]
mod testing;

pub use cache::{CacheConfig, CertificateCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CertSelectionError;
pub use metrics::{CertErrorCounter, PrometheusCertErrors, CERT_ERROR_METRIC, SERVER_NAME_LABEL};
pub use selector::CertificateSelector;
pub use server::{listen_and_serve_tls, TlsServer, TlsServerConfig, TlsServerError};
