//! Per-handshake certificate selection
//!
//! Bridges a ClientHello to a certificate: rejects handshakes without SNI,
//! then either hands the hello to a handshake-aware signer or looks the host
//! name up in the certificate cache. Every failure is counted against the
//! requested host name.

use std::sync::Arc;

use rustls::sign::CertifiedKey;
use tracing::{debug, warn};
use vpki_cert::{CertificateEntry, ClientHelloInfo, HandshakeSigner, SignerCapability};

use crate::cache::{CacheConfig, CertificateCache};
use crate::clock::{Clock, SystemClock};
use crate::error::CertSelectionError;
use crate::metrics::{CertErrorCounter, PrometheusCertErrors};

enum CertificateSource {
    Cache(CertificateCache),
    Handshake(Arc<dyn HandshakeSigner>),
}

/// Chooses the certificate presented for each TLS handshake
pub struct CertificateSelector {
    source: CertificateSource,
    errors: Arc<dyn CertErrorCounter>,
}

impl CertificateSelector {
    pub fn new(capability: SignerCapability, config: CacheConfig) -> Self {
        Self::with_clock(capability, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        capability: SignerCapability,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let source = match capability {
            SignerCapability::Issue(signer) => {
                CertificateSource::Cache(CertificateCache::with_clock(signer, config, clock))
            }
            SignerCapability::Select(signer) => CertificateSource::Handshake(signer),
        };

        Self {
            source,
            errors: Arc::new(PrometheusCertErrors::default()),
        }
    }

    /// Count failures in `errors` instead of a private counter
    pub fn with_error_counter(mut self, errors: Arc<dyn CertErrorCounter>) -> Self {
        self.errors = errors;
        self
    }

    /// The cache, absent when a handshake signer bypasses it
    pub fn cache(&self) -> Option<&CertificateCache> {
        match &self.source {
            CertificateSource::Cache(cache) => Some(cache),
            CertificateSource::Handshake(_) => None,
        }
    }

    /// Select the certificate for one handshake
    pub async fn select(
        &self,
        hello: &ClientHelloInfo,
    ) -> Result<Arc<CertifiedKey>, CertSelectionError> {
        let server_name = hello.server_name();

        let result = self.resolve(server_name, hello).await;
        if let Err(e) = &result {
            warn!("Certificate selection failed for '{}': {}", server_name, e);
            self.errors.increment(server_name);
        }

        result
    }

    async fn resolve(
        &self,
        server_name: &str,
        hello: &ClientHelloInfo,
    ) -> Result<Arc<CertifiedKey>, CertSelectionError> {
        if server_name.is_empty() {
            return Err(CertSelectionError::MissingSni);
        }

        match &self.source {
            CertificateSource::Cache(cache) => {
                let entry = cache.get(server_name).await?;
                Ok(entry.certified_key())
            }
            CertificateSource::Handshake(signer) => {
                debug!("Delegating certificate selection for {}", server_name);
                let certificate = signer
                    .select_certificate(hello)
                    .await
                    .map_err(|e| CertSelectionError::signer(server_name, e))?;
                let entry = CertificateEntry::new(server_name, certificate)
                    .map_err(|e| CertSelectionError::malformed(server_name, e))?;
                Ok(entry.certified_key())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::{whole_second_now, CountingSigner};
    use async_trait::async_trait;
    use mockall::mock;
    use std::time::Duration;
    use vpki_cert::{Certificate, LocalCa, SignerError};

    mock! {
        Selector {}

        #[async_trait]
        impl HandshakeSigner for Selector {
            async fn select_certificate(
                &self,
                hello: &ClientHelloInfo,
            ) -> Result<Certificate, SignerError>;
        }
    }

    fn cached_selector() -> (
        Arc<ManualClock>,
        Arc<CountingSigner>,
        Arc<PrometheusCertErrors>,
        CertificateSelector,
    ) {
        let clock = Arc::new(ManualClock::new(whole_second_now()));
        let signer = Arc::new(CountingSigner::new(clock.clone(), chrono::Duration::hours(1)));
        let errors = Arc::new(PrometheusCertErrors::new().unwrap());
        let selector = CertificateSelector::with_clock(
            SignerCapability::Issue(signer.clone()),
            CacheConfig::default(),
            clock.clone(),
        )
        .with_error_counter(errors.clone());
        (clock, signer, errors, selector)
    }

    #[tokio::test]
    async fn test_missing_sni_never_reaches_signer() {
        let (_clock, signer, errors, selector) = cached_selector();

        for attempt in 1..=2 {
            let err = selector
                .select(&ClientHelloInfo::default())
                .await
                .unwrap_err();
            assert!(matches!(err, CertSelectionError::MissingSni));
            assert_eq!(errors.count(""), attempt);
        }

        assert_eq!(signer.calls(), 0);
        assert!(selector.cache().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cached_selection_success_is_not_counted() {
        let (_clock, signer, errors, selector) = cached_selector();
        let hello = ClientHelloInfo::for_server_name("a.example.com");

        let first = selector.select(&hello).await.unwrap();
        let second = selector.select(&hello).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(signer.calls(), 1);
        assert_eq!(errors.count("a.example.com"), 0);
    }

    #[tokio::test]
    async fn test_signer_failures_are_counted_per_attempt() {
        let (_clock, signer, errors, selector) = cached_selector();
        signer.set_failing(true);
        let hello = ClientHelloInfo::for_server_name("a.example.com");

        for attempt in 1..=3 {
            let err = selector.select(&hello).await.unwrap_err();
            assert!(matches!(err, CertSelectionError::Signer { .. }));
            assert_eq!(errors.count("a.example.com"), attempt);
            assert!(selector.cache().unwrap().peek("a.example.com").is_none());
        }
    }

    #[tokio::test]
    async fn test_handshake_signer_bypasses_cache() {
        let ca = LocalCa::generate("delegate CA").unwrap();
        let certificate = ca
            .sign("b.example.com", Duration::from_secs(3600), 256)
            .unwrap();

        let mut delegate = MockSelector::new();
        delegate
            .expect_select_certificate()
            .withf(|hello| hello.server_name() == "b.example.com")
            .times(2)
            .returning(move |_| Ok(certificate.clone()));

        let errors = Arc::new(PrometheusCertErrors::new().unwrap());
        let selector =
            CertificateSelector::new(SignerCapability::select(delegate), CacheConfig::default())
                .with_error_counter(errors.clone());

        let hello = ClientHelloInfo::for_server_name("b.example.com");
        selector.select(&hello).await.unwrap();
        selector.select(&hello).await.unwrap();

        assert!(selector.cache().is_none());
        assert_eq!(errors.count("b.example.com"), 0);
    }

    #[tokio::test]
    async fn test_handshake_signer_failure_is_counted() {
        let mut delegate = MockSelector::new();
        delegate
            .expect_select_certificate()
            .times(1)
            .returning(|_| Err(SignerError::Rejected("not today".to_string())));

        let errors = Arc::new(PrometheusCertErrors::new().unwrap());
        let selector =
            CertificateSelector::new(SignerCapability::select(delegate), CacheConfig::default())
                .with_error_counter(errors.clone());

        let err = selector
            .select(&ClientHelloInfo::for_server_name("b.example.com"))
            .await
            .unwrap_err();

        assert!(matches!(err, CertSelectionError::Signer { .. }));
        assert_eq!(errors.count("b.example.com"), 1);
    }

    #[tokio::test]
    async fn test_handshake_signer_never_sees_empty_sni() {
        let mut delegate = MockSelector::new();
        delegate.expect_select_certificate().times(0);

        let errors = Arc::new(PrometheusCertErrors::new().unwrap());
        let selector =
            CertificateSelector::new(SignerCapability::select(delegate), CacheConfig::default())
                .with_error_counter(errors.clone());

        let err = selector
            .select(&ClientHelloInfo::default())
            .await
            .unwrap_err();

        assert!(matches!(err, CertSelectionError::MissingSni));
        assert_eq!(errors.count(""), 1);
    }
}
