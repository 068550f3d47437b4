//! Vault PKI signer
//!
//! Keys are generated locally and only a CSR leaves the process; Vault's
//! `sign` endpoint returns the signed leaf and its chain.

use std::time::Duration;

use async_trait::async_trait;
use rcgen::{CertificateParams, DnType, KeyPair, SanType};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::local_ca::{key_algorithm, validate_host_name};
use crate::{
    Certificate, CertificateError, RawPair, Signer, SignerError, DEFAULT_KEY_STRENGTH, DEFAULT_TTL,
};

const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";

/// Vault PKI configuration
#[derive(Clone)]
pub struct VaultConfig {
    /// Vault address, e.g. `https://vault.internal:8200`
    pub addr: String,
    /// Mount point of the PKI secrets engine
    pub mount: String,
    /// Role used for signing
    pub role: String,
    /// Optional e-mail address added to every CSR
    pub email: Option<String>,
    pub token: Option<String>,
    /// Lifetime used by `raw_cert`
    pub ttl: Duration,
    /// Key strength used by `raw_cert`
    pub key_strength: u32,
    /// HTTP request timeout
    pub request_timeout: Duration,
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("addr", &self.addr)
            .field("mount", &self.mount)
            .field("role", &self.role)
            .field("email", &self.email)
            .field("token", &self.token.is_some())
            .field("ttl", &self.ttl)
            .field("key_strength", &self.key_strength)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            addr: "http://127.0.0.1:8200".to_string(),
            mount: "pki".to_string(),
            role: String::new(),
            email: None,
            token: None,
            ttl: DEFAULT_TTL,
            key_strength: DEFAULT_KEY_STRENGTH,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl VaultConfig {
    /// Read `VAULT_ADDR`, `VAULT_TOKEN`, `VPKI_MOUNT`, `VPKI_ROLE` and
    /// `VPKI_EMAIL`, keeping defaults for anything unset
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            addr: std::env::var("VAULT_ADDR").unwrap_or(defaults.addr),
            mount: std::env::var("VPKI_MOUNT").unwrap_or(defaults.mount),
            role: std::env::var("VPKI_ROLE").unwrap_or(defaults.role),
            email: std::env::var("VPKI_EMAIL").ok(),
            token: std::env::var("VAULT_TOKEN").ok(),
            ..defaults
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn sign_url(&self) -> String {
        format!(
            "{}/v1/{}/sign/{}",
            self.addr.trim_end_matches('/'),
            self.mount.trim_matches('/'),
            self.role
        )
    }
}

/// Vault TTL string in whole seconds, rounded up so a short TTL never
/// becomes "0s" (which Vault reads as the role default)
fn ttl_param(ttl: Duration) -> String {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    format!("{}s", secs.max(1))
}

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    csr: &'a str,
    common_name: &'a str,
    format: &'static str,
    ttl: String,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    data: SignData,
}

#[derive(Debug, Deserialize)]
struct SignData {
    certificate: String,
    #[serde(default)]
    ca_chain: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<String>,
}

/// Signer backed by a Vault PKI secrets engine
pub struct VaultSigner {
    config: VaultConfig,
    http: reqwest::Client,
}

impl VaultSigner {
    pub fn new(config: VaultConfig) -> Result<Self, SignerError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SignerError::Backend {
                addr: config.addr.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self { config, http })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Send a PEM CSR to Vault and return the PEM bundle it signed
    pub async fn sign_csr(
        &self,
        csr_pem: &str,
        common_name: &str,
        ttl: Duration,
    ) -> Result<String, SignerError> {
        let body = SignRequest {
            csr: csr_pem,
            common_name,
            format: "pem_bundle",
            ttl: ttl_param(ttl),
        };

        let mut request = self.http.post(self.config.sign_url()).json(&body);
        if let Some(token) = &self.config.token {
            request = request.header(VAULT_TOKEN_HEADER, token);
        }

        let response = request.send().await.map_err(|e| self.backend_error(e))?;
        let status = response.status();

        if !status.is_success() {
            let errors = response
                .json::<ErrorResponse>()
                .await
                .unwrap_or_default()
                .errors;
            return Err(SignerError::Rejected(if errors.is_empty() {
                format!("HTTP {}", status)
            } else {
                format!("HTTP {}: {}", status, errors.join("; "))
            }));
        }

        let signed: SignResponse = response.json().await.map_err(|e| self.backend_error(e))?;

        debug!("Vault signed certificate for {}", common_name);

        let mut bundle = signed.data.certificate;
        for ca in signed.data.ca_chain {
            if !bundle.contains(ca.trim()) {
                if !bundle.ends_with('\n') {
                    bundle.push('\n');
                }
                bundle.push_str(&ca);
            }
        }

        Ok(bundle)
    }

    /// Generate a key and CSR for `host_name` and have Vault sign it
    pub async fn certify(
        &self,
        host_name: &str,
        ttl: Duration,
        key_strength: u32,
    ) -> Result<Certificate, SignerError> {
        let (bundle, key_pair) = self.sign_new_key(host_name, ttl, key_strength).await?;

        let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let cert_chain = rustls_pemfile::certs(&mut bundle.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                CertificateError::Pem(format!("Unparseable certificate bundle: {}", e))
            })?;

        if cert_chain.is_empty() {
            return Err(CertificateError::EmptyChain.into());
        }

        Ok(Certificate::new(cert_chain, private_key))
    }

    /// Like `certify`, but returns the PEM text untouched
    pub async fn raw_cert(&self, common_name: &str) -> Result<RawPair, SignerError> {
        let (bundle, key_pair) = self
            .sign_new_key(common_name, self.config.ttl, self.config.key_strength)
            .await?;

        Ok(RawPair {
            private: key_pair.serialize_pem(),
            public: bundle,
        })
    }

    async fn sign_new_key(
        &self,
        host_name: &str,
        ttl: Duration,
        key_strength: u32,
    ) -> Result<(String, KeyPair), SignerError> {
        validate_host_name(host_name)?;

        let key_pair = KeyPair::generate_for(key_algorithm(key_strength)?)?;
        let csr_pem = self.csr_pem(host_name, &key_pair)?;
        let bundle = self.sign_csr(&csr_pem, host_name, ttl).await?;

        Ok((bundle, key_pair))
    }

    fn csr_pem(&self, host_name: &str, key_pair: &KeyPair) -> Result<String, SignerError> {
        let mut params = CertificateParams::new(vec![host_name.to_string()])
            .map_err(|_| SignerError::InvalidHostName(host_name.to_string()))?;
        params.distinguished_name.push(DnType::CommonName, host_name);
        if let Some(email) = &self.config.email {
            params
                .subject_alt_names
                .push(SanType::Rfc822Name(email.as_str().try_into()?));
        }

        Ok(params.serialize_request(key_pair)?.pem()?)
    }

    fn backend_error(&self, e: reqwest::Error) -> SignerError {
        SignerError::Backend {
            addr: self.config.addr.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl Signer for VaultSigner {
    async fn issue(
        &self,
        host_name: &str,
        ttl: Duration,
        key_strength: u32,
    ) -> Result<Certificate, SignerError> {
        info!("Requesting certificate for {} from {}", host_name, self.config.addr);
        self.certify(host_name, ttl, key_strength).await
    }
}
