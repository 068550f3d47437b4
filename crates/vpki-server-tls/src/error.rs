//! Errors raised while selecting a certificate for a handshake

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use vpki_cert::{CertificateError, SignerError};

/// Certificate selection failure, fatal to the handshake that triggered it
///
/// Cloneable so that every caller waiting on one issuance receives the same
/// error.
#[derive(Debug, Clone, Error)]
pub enum CertSelectionError {
    #[error("Cannot generate certs without TLS SNI (no server name was indicated)")]
    MissingSni,

    #[error("Error acquiring cert for {host_name}: {source}")]
    Signer {
        host_name: String,
        #[source]
        source: Arc<SignerError>,
    },

    #[error("Signer returned unusable certificate for {host_name}: {source}")]
    MalformedCertificate {
        host_name: String,
        #[source]
        source: Arc<CertificateError>,
    },

    #[error("Signer returned a certificate for {host_name} valid only from {not_before} to {not_after}")]
    OutsideValidity {
        host_name: String,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    },

    #[error("Timed out after {timeout:?} waiting for a certificate for {host_name}")]
    Timeout { host_name: String, timeout: Duration },

    #[error("Certificate issuance for {host_name} was aborted")]
    IssuanceAborted { host_name: String },
}

impl CertSelectionError {
    pub(crate) fn signer(host_name: &str, source: SignerError) -> Self {
        match source {
            SignerError::Certificate(source) => Self::malformed(host_name, source),
            source => CertSelectionError::Signer {
                host_name: host_name.to_string(),
                source: Arc::new(source),
            },
        }
    }

    pub(crate) fn malformed(host_name: &str, source: CertificateError) -> Self {
        CertSelectionError::MalformedCertificate {
            host_name: host_name.to_string(),
            source: Arc::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signer_error_message() {
        let err = CertSelectionError::signer(
            "a.example.com",
            SignerError::Rejected("role does not allow host".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "Error acquiring cert for a.example.com: Signing request rejected: role does not allow host"
        );
    }

    #[test]
    fn test_certificate_errors_are_malformed_material() {
        let err = CertSelectionError::signer(
            "a.example.com",
            SignerError::Certificate(CertificateError::EmptyChain),
        );
        assert!(matches!(err, CertSelectionError::MalformedCertificate { .. }));
    }
}
