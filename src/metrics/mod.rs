//! Controller Metrics
//!
//! Prometheus counters and gauges for the cache controller, kept in a private
//! [`Registry`] so that several controllers (tests) can coexist in one process.
//!
//! | Metric                              | Type       | Labels   |
//! |-------------------------------------|------------|----------|
//! | `netcache_inserts_total`            | counter    |          |
//! | `netcache_flushes_total`            | counter    |          |
//! | `netcache_rejected_total`           | counter    | `reason` |
//! | `netcache_reports_total`            | counter    | `op`     |
//! | `netcache_rpc_retries_total`        | counter    |          |
//! | `netcache_resident_keys`            | gauge      |          |
//! | `netcache_used_units`               | gauge      |          |

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::cache::CacheSnapshot;
use crate::error::{Error, Result};

/// Metrics of one controller.
#[derive(Clone)]
pub struct CacheMetrics {
    registry: Registry,
    pub inserts: IntCounter,
    pub flushes: IntCounter,
    pub rejected: IntCounterVec,
    pub reports: IntCounterVec,
    pub rpc_retries: IntCounter,
    pub resident_keys: IntGauge,
    pub used_units: IntGauge,
}

impl CacheMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let inserts = IntCounter::with_opts(Opts::new(
            "netcache_inserts_total",
            "Keys installed in the switch cache",
        ))
        .map_err(metrics_error)?;
        let flushes = IntCounter::with_opts(Opts::new(
            "netcache_flushes_total",
            "Keys removed from the switch cache",
        ))
        .map_err(metrics_error)?;
        let rejected = IntCounterVec::new(
            Opts::new(
                "netcache_rejected_total",
                "Insert or flush requests that failed",
            ),
            &["reason"],
        )
        .map_err(metrics_error)?;
        let reports = IntCounterVec::new(
            Opts::new("netcache_reports_total", "Reports received from the switch"),
            &["op"],
        )
        .map_err(metrics_error)?;
        let rpc_retries = IntCounter::with_opts(Opts::new(
            "netcache_rpc_retries_total",
            "Switch control calls retried after a failure",
        ))
        .map_err(metrics_error)?;
        let resident_keys = IntGauge::new("netcache_resident_keys", "Keys currently cached")
            .map_err(metrics_error)?;
        let used_units = IntGauge::new("netcache_used_units", "Storage units currently owned")
            .map_err(metrics_error)?;

        registry
            .register(Box::new(inserts.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(flushes.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(rejected.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(reports.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(rpc_retries.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(resident_keys.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(used_units.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            inserts,
            flushes,
            rejected,
            reports,
            rpc_retries,
            resident_keys,
            used_units,
        })
    }

    pub fn record_rejected(&self, error: &Error) {
        self.rejected.with_label_values(&[error.kind()]).inc();
    }

    pub fn record_report(&self, op: &str) {
        self.reports.with_label_values(&[op]).inc();
    }

    /// Update the occupancy gauges.
    pub fn observe(&self, snapshot: &CacheSnapshot) {
        self.resident_keys.set(snapshot.resident_keys as i64);
        self.used_units.set(snapshot.used_units as i64);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text format.
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

impl std::fmt::Debug for CacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMetrics")
            .field("inserts", &self.inserts.get())
            .field("flushes", &self.flushes.get())
            .field("resident_keys", &self.resident_keys.get())
            .finish()
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
