//! Certificate material and signing backends
//!
//! Provides the `Signer` seam used by the TLS server to obtain short-lived
//! leaf certificates per host name, plus the concrete signers: an in-process
//! certificate authority and a Vault PKI client.

pub mod certificate;
pub mod local_ca;
pub mod raw;
pub mod signer;
pub mod vault;

pub use certificate::{Certificate, CertificateEntry, CertificateError, Validity};
pub use local_ca::LocalCa;
pub use raw::RawPair;
pub use signer::{
    ClientHelloInfo, HandshakeSigner, Signer, SignerCapability, SignerError, DEFAULT_KEY_STRENGTH,
    DEFAULT_TTL,
};
pub use vault::{VaultConfig, VaultSigner};
