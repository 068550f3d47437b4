//! Host-name keyed certificate cache with single-flight issuance
//!
//! Fresh entries are served straight from the map. A missing or stale entry
//! starts one issuance task per host name; every caller that arrives while it
//! runs awaits the same result. Issuance runs on its own task, so a caller
//! that gives up (timeout, dropped handshake) never cancels it and the
//! certificate is still stored for the next lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use futures::future::{self, BoxFuture, FutureExt, Shared};
use tracing::{debug, error, info, trace, warn};
use vpki_cert::{CertificateEntry, Signer, DEFAULT_KEY_STRENGTH, DEFAULT_TTL};

use crate::clock::{Clock, SystemClock};
use crate::error::CertSelectionError;

type IssueResult = Result<Arc<CertificateEntry>, CertSelectionError>;
type Issuance = Shared<BoxFuture<'static, IssueResult>>;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Lifetime requested from the signer
    pub ttl: Duration,
    /// Key strength passed to the signer
    pub key_strength: u32,
    /// Upper bound on how long a caller waits for an issuance, `None` waits forever
    pub issue_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            key_strength: DEFAULT_KEY_STRENGTH,
            issue_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Certificate cache keyed by host name
#[derive(Clone)]
pub struct CertificateCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    signer: Arc<dyn Signer>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    /// Most recent successful issuance per host name
    entries: RwLock<HashMap<String, Arc<CertificateEntry>>>,
    /// At most one running issuance per host name
    in_flight: Mutex<HashMap<String, Issuance>>,
}

impl CertificateCache {
    pub fn new(signer: Arc<dyn Signer>, config: CacheConfig) -> Self {
        Self::with_clock(signer, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        signer: Arc<dyn Signer>,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                signer,
                config,
                clock,
                entries: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Return a fresh certificate for `host_name`, issuing one if needed
    ///
    /// A failed issuance leaves whatever was cached before untouched. Stale
    /// entries are never returned, not even as a fallback.
    pub async fn get(
        &self,
        host_name: &str,
    ) -> Result<Arc<CertificateEntry>, CertSelectionError> {
        if let Some(entry) = self.inner.fresh_entry(host_name) {
            trace!("Certificate cache hit for {}", host_name);
            return Ok(entry);
        }

        let issuance = self.inner.join_or_start(host_name);

        match self.inner.config.issue_timeout {
            Some(timeout) => tokio::time::timeout(timeout, issuance)
                .await
                .map_err(|_| {
                    warn!(
                        "Gave up waiting {:?} for a certificate for {}",
                        timeout, host_name
                    );
                    CertSelectionError::Timeout {
                        host_name: host_name.to_string(),
                        timeout,
                    }
                })?,
            None => issuance.await,
        }
    }

    /// The stored entry for `host_name`, fresh or not
    pub fn peek(&self, host_name: &str) -> Option<Arc<CertificateEntry>> {
        self.inner.read_entries().get(host_name).cloned()
    }

    /// Number of host names with a stored entry
    pub fn len(&self) -> usize {
        self.inner.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an issuance for `host_name` is currently running
    pub fn is_issuing(&self, host_name: &str) -> bool {
        self.inner.lock_in_flight().contains_key(host_name)
    }
}

impl CacheInner {
    fn read_entries(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<CertificateEntry>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, Issuance>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh_entry(&self, host_name: &str) -> Option<Arc<CertificateEntry>> {
        let now = self.clock.now();
        self.read_entries()
            .get(host_name)
            .filter(|entry| entry.is_fresh_at(now))
            .cloned()
    }

    fn join_or_start(self: &Arc<Self>, host_name: &str) -> Issuance {
        let mut in_flight = self.lock_in_flight();

        if let Some(issuance) = in_flight.get(host_name) {
            debug!("Joining in-flight issuance for {}", host_name);
            return issuance.clone();
        }

        // An issuance may have completed between the freshness check and the lock
        if let Some(entry) = self.fresh_entry(host_name) {
            return future::ready(Ok(entry)).boxed().shared();
        }

        let inner = Arc::clone(self);
        let host = host_name.to_string();
        let task = tokio::spawn(async move { inner.issue(host).await });

        let host = host_name.to_string();
        let issuance = async move {
            task.await.unwrap_or_else(|e| {
                error!("Certificate issuance task for {} failed: {}", host, e);
                Err(CertSelectionError::IssuanceAborted { host_name: host })
            })
        }
        .boxed()
        .shared();

        in_flight.insert(host_name.to_string(), issuance.clone());
        issuance
    }

    async fn issue(self: Arc<Self>, host_name: String) -> IssueResult {
        let _in_flight = InFlightGuard {
            cache: &*self,
            host_name: host_name.as_str(),
        };

        info!("Issuing certificate for {}", host_name);
        let started = Instant::now();

        let certificate = self
            .signer
            .issue(&host_name, self.config.ttl, self.config.key_strength)
            .await
            .map_err(|e| {
                warn!("Signer failed for {}: {}", host_name, e);
                CertSelectionError::signer(&host_name, e)
            })?;

        let entry = CertificateEntry::new(host_name.clone(), certificate).map_err(|e| {
            warn!("Signer returned unusable material for {}: {}", host_name, e);
            CertSelectionError::malformed(&host_name, e)
        })?;
        let entry = Arc::new(entry);

        if !entry.is_fresh_at(self.clock.now()) {
            warn!(
                "Issued certificate for {} is outside its validity window ({} - {})",
                host_name,
                entry.not_before(),
                entry.not_after()
            );
            return Err(CertSelectionError::OutsideValidity {
                host_name: host_name.clone(),
                not_before: entry.not_before(),
                not_after: entry.not_after(),
            });
        }

        // Stored before the in-flight slot is released, so a caller that finds
        // no issuance running always sees this entry.
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host_name.clone(), Arc::clone(&entry));

        info!(
            "Issued certificate for {} in {:?}, valid until {}",
            host_name,
            started.elapsed(),
            entry.not_after()
        );

        Ok(entry)
    }
}

/// Releases the in-flight slot however the issuance ends, panics included
struct InFlightGuard<'a> {
    cache: &'a CacheInner,
    host_name: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.cache.lock_in_flight().remove(self.host_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::{whole_second_now, CountingSigner};
    use chrono::Duration as ChronoDuration;

    fn cache_with(
        clock: &Arc<ManualClock>,
        signer: &Arc<CountingSigner>,
        issue_timeout: Option<Duration>,
    ) -> CertificateCache {
        CertificateCache::with_clock(
            signer.clone(),
            CacheConfig {
                issue_timeout,
                ..Default::default()
            },
            clock.clone(),
        )
    }

    fn setup() -> (Arc<ManualClock>, Arc<CountingSigner>, CertificateCache) {
        let clock = Arc::new(ManualClock::new(whole_second_now()));
        let signer = Arc::new(CountingSigner::new(clock.clone(), ChronoDuration::hours(1)));
        let cache = cache_with(&clock, &signer, None);
        (clock, signer, cache)
    }

    #[tokio::test]
    async fn test_first_lookup_issues_once() {
        let (clock, signer, cache) = setup();

        let entry = cache.get("a.example.com").await.unwrap();

        assert_eq!(signer.calls(), 1);
        assert_eq!(entry.host_name(), "a.example.com");
        assert!(entry.is_fresh_at(clock.now()));
        assert!(!cache.is_issuing("a.example.com"));
    }

    #[tokio::test]
    async fn test_fresh_entry_is_served_from_cache() {
        let (clock, signer, cache) = setup();

        let first = cache.get("a.example.com").await.unwrap();
        clock.advance(ChronoDuration::minutes(30));
        let second = cache.get("a.example.com").await.unwrap();
        let third = cache.get("a.example.com").await.unwrap();

        assert_eq!(signer.calls(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn test_host_names_are_cached_separately() {
        let (_clock, signer, cache) = setup();

        let a = cache.get("a.example.com").await.unwrap();
        let b = cache.get("b.example.com").await.unwrap();

        assert_eq!(signer.calls(), 2);
        assert_eq!(cache.len(), 2);
        assert_ne!(a.certificate().cert_chain[0], b.certificate().cert_chain[0]);
    }

    #[tokio::test]
    async fn test_expired_entry_is_replaced() {
        let (clock, signer, cache) = setup();
        let t0 = clock.now();

        let old = cache.get("a.example.com").await.unwrap();
        clock.advance(ChronoDuration::minutes(90));
        let new = cache.get("a.example.com").await.unwrap();

        assert_eq!(signer.calls(), 2);
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(new.not_before() >= t0 + ChronoDuration::minutes(90));
        assert!(Arc::ptr_eq(&cache.peek("a.example.com").unwrap(), &new));

        let again = cache.get("a.example.com").await.unwrap();
        assert!(Arc::ptr_eq(&again, &new));
        assert_eq!(signer.calls(), 2);
    }

    #[tokio::test]
    async fn test_not_yet_valid_entry_is_reissued() {
        let (clock, signer, cache) = setup();

        cache.get("a.example.com").await.unwrap();
        clock.advance(ChronoDuration::minutes(-10));
        let entry = cache.get("a.example.com").await.unwrap();

        assert_eq!(signer.calls(), 2);
        assert!(entry.is_fresh_at(clock.now()));
    }

    #[tokio::test]
    async fn test_failing_signer_leaves_cache_empty() {
        let (_clock, signer, cache) = setup();
        signer.set_failing(true);

        for attempt in 1..=3 {
            let err = cache.get("a.example.com").await.unwrap_err();
            assert!(matches!(err, CertSelectionError::Signer { .. }));
            assert_eq!(signer.calls(), attempt);
            assert!(cache.peek("a.example.com").is_none());
        }

        signer.set_failing(false);
        assert!(cache.get("a.example.com").await.is_ok());
        assert_eq!(signer.calls(), 4);
    }

    #[tokio::test]
    async fn test_failed_reissue_keeps_stale_entry_but_does_not_serve_it() {
        let (clock, signer, cache) = setup();

        let old = cache.get("a.example.com").await.unwrap();
        clock.advance(ChronoDuration::hours(2));
        signer.set_failing(true);

        let err = cache.get("a.example.com").await.unwrap_err();
        assert!(matches!(err, CertSelectionError::Signer { .. }));
        assert!(Arc::ptr_eq(&cache.peek("a.example.com").unwrap(), &old));
    }

    #[tokio::test]
    async fn test_malformed_material_is_not_cached() {
        let (_clock, signer, cache) = setup();
        signer.set_empty_chain(true);

        let err = cache.get("a.example.com").await.unwrap_err();

        assert!(matches!(err, CertSelectionError::MalformedCertificate { .. }));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_already_expired_certificate_is_rejected() {
        let (_clock, signer, cache) = setup();
        signer.set_window_offset(ChronoDuration::hours(-2));

        let err = cache.get("a.example.com").await.unwrap_err();

        assert!(matches!(err, CertSelectionError::OutsideValidity { .. }));
        assert!(cache.peek("a.example.com").is_none());
        assert_eq!(signer.calls(), 1);
    }

    #[tokio::test]
    async fn test_not_yet_valid_certificate_is_rejected() {
        let (clock, signer, cache) = setup();
        signer.set_window_offset(ChronoDuration::minutes(10));

        let err = cache.get("a.example.com").await.unwrap_err();
        match err {
            CertSelectionError::OutsideValidity { not_before, .. } => {
                assert!(not_before > clock.now())
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(cache.is_empty());

        signer.set_window_offset(ChronoDuration::zero());
        let entry = cache.get("a.example.com").await.unwrap();
        assert!(entry.is_fresh_at(clock.now()));
        assert_eq!(signer.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lookups_share_one_issuance() {
        let clock = Arc::new(ManualClock::new(whole_second_now()));
        let signer = Arc::new(
            CountingSigner::new(clock.clone(), ChronoDuration::hours(1))
                .with_delay(Duration::from_millis(200)),
        );
        let cache = cache_with(&clock, &signer, None);

        let lookups: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get("a.example.com").await })
            })
            .collect();

        let mut entries = Vec::new();
        for lookup in lookups {
            entries.push(lookup.await.unwrap().unwrap());
        }

        assert_eq!(signer.calls(), 1);
        assert!(entries.iter().all(|e| Arc::ptr_eq(e, &entries[0])));
        assert!(entries[0].is_fresh_at(clock.now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_cancel_issuance() {
        let clock = Arc::new(ManualClock::new(whole_second_now()));
        let signer = Arc::new(
            CountingSigner::new(clock.clone(), ChronoDuration::hours(1))
                .with_delay(Duration::from_secs(10)),
        );
        let cache = cache_with(&clock, &signer, Some(Duration::from_secs(1)));

        let err = cache.get("a.example.com").await.unwrap_err();
        assert!(matches!(err, CertSelectionError::Timeout { .. }));
        assert!(cache.is_issuing("a.example.com"));

        tokio::time::sleep(Duration::from_secs(20)).await;

        assert!(!cache.is_issuing("a.example.com"));
        assert!(cache.peek("a.example.com").is_some());
        cache.get("a.example.com").await.unwrap();
        assert_eq!(signer.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_lookup_still_caches_result() {
        let clock = Arc::new(ManualClock::new(whole_second_now()));
        let signer = Arc::new(
            CountingSigner::new(clock.clone(), ChronoDuration::hours(1))
                .with_delay(Duration::from_secs(5)),
        );
        let cache = cache_with(&clock, &signer, None);

        let lookup = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("a.example.com").await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        lookup.abort();

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(cache.peek("a.example.com").is_some());
        assert_eq!(signer.calls(), 1);
    }
}
