//! Raw PEM export for consumers that need text instead of a TLS-ready key

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rustls::pki_types::PrivateKeyDer;

use crate::Certificate;

const PEM_LINE_WIDTH: usize = 64;

/// Explicitly named PEM pair, so public and private halves cannot be swapped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPair {
    /// Private key PEM
    pub private: String,
    /// Certificate chain PEM, leaf first
    pub public: String,
}

impl Certificate {
    pub fn to_raw_pair(&self) -> RawPair {
        let public = self
            .cert_chain
            .iter()
            .map(|cert| pem_block("CERTIFICATE", cert.as_ref()))
            .collect();

        let (label, der) = match &self.private_key {
            PrivateKeyDer::Pkcs1(key) => ("RSA PRIVATE KEY", key.secret_pkcs1_der()),
            PrivateKeyDer::Sec1(key) => ("EC PRIVATE KEY", key.secret_sec1_der()),
            PrivateKeyDer::Pkcs8(key) => ("PRIVATE KEY", key.secret_pkcs8_der()),
            _ => ("PRIVATE KEY", self.private_key.secret_der()),
        };

        RawPair {
            private: pem_block(label, der),
            public,
        }
    }
}

fn pem_block(label: &str, der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = format!("-----BEGIN {}-----\n", label);
    for line in encoded.as_bytes().chunks(PEM_LINE_WIDTH) {
        // base64 output is ASCII
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {}-----\n", label));
    pem
}
