//! Certificate selection error counter

use std::sync::OnceLock;

use prometheus::{IntCounterVec, Opts, Registry};
use tracing::warn;

pub const CERT_ERROR_METRIC: &str = "vpki_cert_error";
pub const SERVER_NAME_LABEL: &str = "server_name";

/// Counts certificate selection failures per requested host name
pub trait CertErrorCounter: Send + Sync {
    fn increment(&self, server_name: &str);
}

/// Prometheus-backed error counter
#[derive(Clone)]
pub struct PrometheusCertErrors {
    counter: IntCounterVec,
}

impl PrometheusCertErrors {
    pub fn new() -> Result<Self, prometheus::Error> {
        let counter = IntCounterVec::new(
            Opts::new(
                CERT_ERROR_METRIC,
                "vpki encountered an error obtaining a certificate",
            ),
            &[SERVER_NAME_LABEL],
        )?;
        Ok(Self { counter })
    }

    /// Create the counter and register it with `registry`
    pub fn registered(registry: &Registry) -> Result<Self, prometheus::Error> {
        let errors = Self::new()?;
        registry.register(Box::new(errors.counter.clone()))?;
        Ok(errors)
    }

    /// Current count for one host name
    pub fn count(&self, server_name: &str) -> u64 {
        self.counter.with_label_values(&[server_name]).get()
    }
}

static GLOBAL_CERT_ERRORS: OnceLock<PrometheusCertErrors> = OnceLock::new();

impl PrometheusCertErrors {
    /// Process-wide counter, registered once in `prometheus::default_registry()`
    pub fn global() -> Self {
        GLOBAL_CERT_ERRORS
            .get_or_init(|| {
                let errors = Self::new().expect("static metric options are valid");
                if let Err(e) = prometheus::register(Box::new(errors.counter.clone())) {
                    warn!("Failed to register {}: {}", CERT_ERROR_METRIC, e);
                }
                errors
            })
            .clone()
    }
}

/// The process-wide counter, see `global`
impl Default for PrometheusCertErrors {
    fn default() -> Self {
        Self::global()
    }
}

impl CertErrorCounter for PrometheusCertErrors {
    fn increment(&self, server_name: &str) {
        self.counter.with_label_values(&[server_name]).inc();
    }
}
