//! Signer doubles shared by the unit tests

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vpki_cert::{Certificate, LocalCa, Signer, SignerError, Validity};

use crate::clock::{Clock, ManualClock};

/// Certificate times carry whole seconds, so test clocks start on one
pub(crate) fn whole_second_now() -> DateTime<Utc> {
    DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap()
}

/// Signs real certificates whose window starts at the manual clock's `now`
pub(crate) struct CountingSigner {
    ca: LocalCa,
    clock: Arc<ManualClock>,
    lifetime: chrono::Duration,
    delay: Duration,
    fail: AtomicBool,
    empty_chain: AtomicBool,
    /// Seconds added to `now` before the window starts
    window_offset: AtomicI64,
    calls: AtomicUsize,
}

impl CountingSigner {
    pub(crate) fn new(clock: Arc<ManualClock>, lifetime: chrono::Duration) -> Self {
        Self {
            ca: LocalCa::generate("counting signer CA").unwrap(),
            clock,
            lifetime,
            delay: Duration::ZERO,
            fail: AtomicBool::new(false),
            empty_chain: AtomicBool::new(false),
            window_offset: AtomicI64::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleep this long inside every `issue` call
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_empty_chain(&self, empty: bool) {
        self.empty_chain.store(empty, Ordering::SeqCst);
    }

    /// Shift the issued window away from the clock's `now`
    pub(crate) fn set_window_offset(&self, offset: chrono::Duration) {
        self.window_offset
            .store(offset.num_seconds(), Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Signer for CountingSigner {
    async fn issue(
        &self,
        host_name: &str,
        _ttl: Duration,
        key_strength: u32,
    ) -> Result<Certificate, SignerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(SignerError::Backend {
                addr: "http://pki.test".to_string(),
                reason: "backend unreachable".to_string(),
            });
        }

        let offset = chrono::Duration::seconds(self.window_offset.load(Ordering::SeqCst));
        let now = self.clock.now() + offset;
        let mut certificate = self.ca.sign_for_window(
            host_name,
            Validity {
                not_before: now,
                not_after: now + self.lifetime,
            },
            key_strength,
        )?;

        if self.empty_chain.load(Ordering::SeqCst) {
            certificate.cert_chain.clear();
        }

        Ok(certificate)
    }
}
