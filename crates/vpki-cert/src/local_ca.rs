//! In-process certificate authority built on rcgen

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SignatureAlgorithm,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::{Certificate, Signer, SignerError, Validity};

/// Leaves are backdated by this much to tolerate client clock skew
const CLOCK_SKEW_ALLOWANCE: time::Duration = time::Duration::minutes(5);

/// CA lifetime
const CA_VALIDITY: time::Duration = time::Duration::days(365);

/// Certificate authority held in memory
///
/// Signs leaves for host names directly (`Signer`) or signs CSRs produced
/// elsewhere (`sign_request`).
pub struct LocalCa {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
}

impl LocalCa {
    /// Generate a fresh CA with the given common name
    pub fn generate(common_name: &str) -> Result<Self, SignerError> {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - CLOCK_SKEW_ALLOWANCE;
        params.not_after = now + CA_VALIDITY;

        let ca_key = KeyPair::generate()?;
        let ca_cert = params.self_signed(&ca_key)?;
        let ca_cert_pem = ca_cert.pem();

        info!("Generated local CA '{}'", common_name);

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem,
        })
    }

    /// CA certificate in PEM format, for client trust stores
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// CA certificate in DER format
    pub fn ca_cert_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    /// Generate a key and a leaf certificate for `host_name`
    pub fn sign(
        &self,
        host_name: &str,
        ttl: Duration,
        key_strength: u32,
    ) -> Result<Certificate, SignerError> {
        let now = OffsetDateTime::now_utc();
        self.sign_leaf(
            host_name,
            now - CLOCK_SKEW_ALLOWANCE,
            now + std_to_time(ttl),
            key_strength,
        )
    }

    /// Like `sign`, with an explicit validity window
    pub fn sign_for_window(
        &self,
        host_name: &str,
        validity: Validity,
        key_strength: u32,
    ) -> Result<Certificate, SignerError> {
        self.sign_leaf(
            host_name,
            chrono_to_time(validity.not_before)?,
            chrono_to_time(validity.not_after)?,
            key_strength,
        )
    }

    fn sign_leaf(
        &self,
        host_name: &str,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
        key_strength: u32,
    ) -> Result<Certificate, SignerError> {
        validate_host_name(host_name)?;

        let mut params = CertificateParams::new(vec![host_name.to_string()])
            .map_err(|_| SignerError::InvalidHostName(host_name.to_string()))?;
        params.distinguished_name.push(DnType::CommonName, host_name);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate_for(key_algorithm(key_strength)?)?;
        let leaf = params.signed_by(&key_pair, &self.ca_cert, &self.ca_key)?;

        debug!("Signed leaf certificate for {}", host_name);

        Ok(Certificate::new(
            vec![leaf.der().clone(), self.ca_cert_der()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        ))
    }

    /// Sign a PEM CSR, returning the leaf followed by the CA certificate as PEM
    pub fn sign_request(&self, csr_pem: &str, ttl: Duration) -> Result<String, SignerError> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| SignerError::Rejected(format!("Invalid CSR: {}", e)))?;
        set_validity(&mut csr.params, ttl);

        let leaf = csr.signed_by(&self.ca_cert, &self.ca_key)?;

        Ok(format!("{}{}", leaf.pem(), self.ca_cert_pem))
    }
}

#[async_trait]
impl Signer for LocalCa {
    async fn issue(
        &self,
        host_name: &str,
        ttl: Duration,
        key_strength: u32,
    ) -> Result<Certificate, SignerError> {
        self.sign(host_name, ttl, key_strength)
    }
}

fn set_validity(params: &mut CertificateParams, ttl: Duration) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now - CLOCK_SKEW_ALLOWANCE;
    params.not_after = now + std_to_time(ttl);
}

fn std_to_time(ttl: Duration) -> time::Duration {
    time::Duration::seconds(ttl.as_secs() as i64)
}

fn chrono_to_time(at: DateTime<Utc>) -> Result<OffsetDateTime, SignerError> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| SignerError::InvalidValidity(e.to_string()))
}

/// Map a key strength onto an ECDSA curve
pub(crate) fn key_algorithm(
    key_strength: u32,
) -> Result<&'static SignatureAlgorithm, SignerError> {
    match key_strength {
        256 => Ok(&rcgen::PKCS_ECDSA_P256_SHA256),
        384 => Ok(&rcgen::PKCS_ECDSA_P384_SHA384),
        other => Err(SignerError::UnsupportedKeyStrength(other)),
    }
}

/// Validate a host name before it goes into a certificate request
pub(crate) fn validate_host_name(host_name: &str) -> Result<(), SignerError> {
    if host_name.is_empty() {
        return Err(SignerError::InvalidHostName(
            "Host name cannot be empty".to_string(),
        ));
    }

    if host_name.contains(char::is_whitespace) {
        return Err(SignerError::InvalidHostName(format!(
            "Host name cannot contain spaces: {}",
            host_name
        )));
    }

    if host_name.starts_with('.') || host_name.ends_with('.') {
        return Err(SignerError::InvalidHostName(format!(
            "Host name cannot start or end with a dot: {}",
            host_name
        )));
    }

    Ok(())
}
