//! Prometheus metrics for monitoring the message cache.
//!
//! Every cache layer reports lookups (by how they were served), refresh
//! failures, refresh latency and entry counts under its layer name. Source
//! loads and top-level resolutions are tracked separately.

use prometheus::{
    Counter, CounterVec, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::sync::Arc;
use tracing::error;

/// All metrics for the mimir message cache
pub struct Metrics {
    pub registry: Registry,

    // Cache layer metrics
    pub cache_lookups_total: CounterVec,
    pub cache_refresh_failures_total: CounterVec,
    pub cache_refresh_duration_seconds: HistogramVec,
    pub cache_entries: GaugeVec,
    pub cache_clears_total: Counter,

    // Source metrics
    pub source_loads_total: CounterVec,
    pub source_load_duration_seconds: Histogram,

    // Resolution metrics
    pub resolutions_total: CounterVec,
    pub resolution_duration_seconds: HistogramVec,
}

impl Metrics {
    /// Create a new metrics registry with all metrics
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let cache_lookups_total = CounterVec::new(
            Opts::new(
                "mimir_cache_lookups_total",
                "Cache lookups by layer and how they were served",
            ),
            &["layer", "outcome"],
        )?;
        registry.register(Box::new(cache_lookups_total.clone()))?;

        let cache_refresh_failures_total = CounterVec::new(
            Opts::new(
                "mimir_cache_refresh_failures_total",
                "Refreshes whose updater returned an error",
            ),
            &["layer"],
        )?;
        registry.register(Box::new(cache_refresh_failures_total.clone()))?;

        let cache_refresh_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "mimir_cache_refresh_duration_seconds",
                "Time spent refreshing a cache entry, including lock wait",
            )
            .buckets(vec![
                0.00001, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0,
            ]),
            &["layer"],
        )?;
        registry.register(Box::new(cache_refresh_duration_seconds.clone()))?;

        let cache_entries = GaugeVec::new(
            Opts::new("mimir_cache_entries", "Number of cells per cache layer"),
            &["layer"],
        )?;
        registry.register(Box::new(cache_entries.clone()))?;

        let cache_clears_total = Counter::with_opts(Opts::new(
            "mimir_cache_clears_total",
            "Explicit full cache clears",
        ))?;
        registry.register(Box::new(cache_clears_total.clone()))?;

        let source_loads_total = CounterVec::new(
            Opts::new("mimir_source_loads_total", "Bundle source parses"),
            &["kind", "status"],
        )?;
        registry.register(Box::new(source_loads_total.clone()))?;

        let source_load_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "mimir_source_load_duration_seconds",
                "Time spent reading and parsing one bundle source",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )?;
        registry.register(Box::new(source_load_duration_seconds.clone()))?;

        let resolutions_total = CounterVec::new(
            Opts::new("mimir_resolutions_total", "Message code resolutions"),
            &["kind", "status"],
        )?;
        registry.register(Box::new(resolutions_total.clone()))?;

        let resolution_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "mimir_resolution_duration_seconds",
                "Message code resolution duration",
            )
            .buckets(vec![
                0.000001, 0.00001, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1,
            ]),
            &["kind"],
        )?;
        registry.register(Box::new(resolution_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            cache_lookups_total,
            cache_refresh_failures_total,
            cache_refresh_duration_seconds,
            cache_entries,
            cache_clears_total,
            source_loads_total,
            source_load_duration_seconds,
            resolutions_total,
            resolution_duration_seconds,
        })
    }

    /// Record a served cache lookup
    pub fn record_lookup(&self, layer: &str, outcome: &str) {
        self.cache_lookups_total
            .with_label_values(&[layer, outcome])
            .inc();
    }

    /// Record a failed refresh
    pub fn record_refresh_failure(&self, layer: &str) {
        self.cache_refresh_failures_total
            .with_label_values(&[layer])
            .inc();
    }

    pub fn record_refresh_duration(&self, layer: &str, duration_secs: f64) {
        self.cache_refresh_duration_seconds
            .with_label_values(&[layer])
            .observe(duration_secs);
    }

    /// Adjust a layer's entry count by `delta`
    pub fn add_entries(&self, layer: &str, delta: i64) {
        self.cache_entries
            .with_label_values(&[layer])
            .add(delta as f64);
    }

    pub fn record_clear(&self) {
        self.cache_clears_total.inc();
    }

    /// Record a bundle source load
    pub fn record_source_load(&self, kind: &str, status: &str, duration_secs: f64) {
        self.source_loads_total
            .with_label_values(&[kind, status])
            .inc();
        self.source_load_duration_seconds.observe(duration_secs);
    }

    /// Record a resolution request
    pub fn record_resolution(&self, kind: &str, status: &str, duration_secs: f64) {
        self.resolutions_total
            .with_label_values(&[kind, status])
            .inc();
        self.resolution_duration_seconds
            .with_label_values(&[kind])
            .observe(duration_secs);
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                String::new()
            }
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}

/// Shared metrics instance
pub type SharedMetrics = Arc<Metrics>;

/// Create a shared metrics instance
pub fn create_metrics() -> SharedMetrics {
    Arc::new(Metrics::default())
}
