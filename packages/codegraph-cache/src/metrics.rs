//! Prometheus metrics for the artifact cache

use crate::CacheResult;
use prometheus::{register_int_counter_with_registry, IntCounter, Opts, Registry};

/// Cache lookup metrics
#[derive(Clone)]
pub struct CacheMetrics {
    pub hits: IntCounter,
    pub misses: IntCounter,
    pub stale: IntCounter,
    pub writes: IntCounter,
    pub analyzer_failures: IntCounter,
    pub stale_served: IntCounter,
}

impl CacheMetrics {
    pub fn new(registry: &Registry) -> CacheResult<Self> {
        Ok(Self {
            hits: register_int_counter_with_registry!(
                Opts::new("codegraph_cache_hits_total", "Lookups served from the store"),
                registry
            )?,
            misses: register_int_counter_with_registry!(
                Opts::new(
                    "codegraph_cache_misses_total",
                    "Lookups with no stored entry"
                ),
                registry
            )?,
            stale: register_int_counter_with_registry!(
                Opts::new(
                    "codegraph_cache_stale_total",
                    "Lookups whose stored fingerprint no longer matched"
                ),
                registry
            )?,
            writes: register_int_counter_with_registry!(
                Opts::new("codegraph_cache_writes_total", "Artifacts published"),
                registry
            )?,
            analyzer_failures: register_int_counter_with_registry!(
                Opts::new(
                    "codegraph_cache_analyzer_failures_total",
                    "Recomputations that failed in the analyzer"
                ),
                registry
            )?,
            stale_served: register_int_counter_with_registry!(
                Opts::new(
                    "codegraph_cache_stale_served_total",
                    "Stale artifacts returned after an analyzer failure"
                ),
                registry
            )?,
        })
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.get() as f64;
        let total = hits + (self.misses.get() + self.stale.get()) as f64;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }
}
