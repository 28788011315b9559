//! Prometheus metrics for the registry and backend client.

use prometheus::{Counter, Histogram, HistogramOpts, Registry, TextEncoder};

use crate::error::{Error, Result};

/// Configuration for plugin metrics collection.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric prefix for all plugin metrics.
    pub prefix: String,
    /// Whether to record call durations.
    pub detailed_timing: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prefix: "monitor_plugin".to_string(),
            detailed_timing: true,
        }
    }
}

impl MetricsConfig {
    /// Create a new metrics configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the metric prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Enable or disable call timing.
    pub fn with_detailed_timing(mut self, enabled: bool) -> Self {
        self.detailed_timing = enabled;
        self
    }
}

/// Plugin metrics collector.
pub struct PluginMetrics {
    config: MetricsConfig,
    registry: Registry,
    plugins_added: Counter,
    plugins_removed: Counter,
    forced_releases: Counter,
    plugin_errors: Counter,
    start_duration: Histogram,
    call_duration: Histogram,
}

fn metric_err(err: prometheus::Error) -> Error {
    Error::Metrics(err.to_string())
}

impl PluginMetrics {
    /// Create a new metrics collector with the given configuration.
    pub fn new(config: MetricsConfig) -> Result<Self> {
        let registry = Registry::new();
        let prefix = &config.prefix;

        let plugins_added = Counter::new(
            format!("{prefix}_added_total"),
            "Total number of plugins published in the registry",
        )
        .map_err(metric_err)?;

        let plugins_removed = Counter::new(
            format!("{prefix}_removed_total"),
            "Total number of plugins removed from the registry",
        )
        .map_err(metric_err)?;

        let forced_releases = Counter::new(
            format!("{prefix}_forced_releases_total"),
            "Removals that cut off in-flight calls after the drain timeout",
        )
        .map_err(metric_err)?;

        let plugin_errors = Counter::new(
            format!("{prefix}_errors_total"),
            "Total number of per-plugin registration errors",
        )
        .map_err(metric_err)?;

        let start_duration = Histogram::with_opts(
            HistogramOpts::new(
                format!("{prefix}_start_duration_seconds"),
                "Backend start duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .map_err(metric_err)?;

        let call_duration = Histogram::with_opts(
            HistogramOpts::new(
                format!("{prefix}_call_duration_seconds"),
                "Backend call duration in seconds",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .map_err(metric_err)?;

        registry.register(Box::new(plugins_added.clone())).map_err(metric_err)?;
        registry.register(Box::new(plugins_removed.clone())).map_err(metric_err)?;
        registry.register(Box::new(forced_releases.clone())).map_err(metric_err)?;
        registry.register(Box::new(plugin_errors.clone())).map_err(metric_err)?;
        registry.register(Box::new(start_duration.clone())).map_err(metric_err)?;
        registry.register(Box::new(call_duration.clone())).map_err(metric_err)?;

        Ok(Self {
            config,
            registry,
            plugins_added,
            plugins_removed,
            forced_releases,
            plugin_errors,
            start_duration,
            call_duration,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Get the Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a published plugin and how long its backend took to start.
    pub fn record_added(&self, start_secs: f64) {
        self.plugins_added.inc();
        self.start_duration.observe(start_secs);
    }

    /// Record a removal.
    pub fn record_removed(&self, forced: bool) {
        self.plugins_removed.inc();
        if forced {
            self.forced_releases.inc();
        }
    }

    /// Record a registration error.
    pub fn record_error(&self) {
        self.plugin_errors.inc();
    }

    /// Record a backend call.
    pub fn record_call(&self, duration_secs: f64) {
        if self.config.detailed_timing {
            self.call_duration.observe(duration_secs);
        }
    }

    /// Total plugins added.
    pub fn plugins_added_total(&self) -> u64 {
        self.plugins_added.get() as u64
    }

    /// Total plugins removed.
    pub fn plugins_removed_total(&self) -> u64 {
        self.plugins_removed.get() as u64
    }

    /// Total forced releases.
    pub fn forced_releases_total(&self) -> u64 {
        self.forced_releases.get() as u64
    }

    /// Total registration errors.
    pub fn plugin_errors_total(&self) -> u64 {
        self.plugin_errors.get() as u64
    }

    /// Encode all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .map_err(metric_err)
    }
}

impl std::fmt::Debug for PluginMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginMetrics")
            .field("config", &self.config)
            .field("plugins_added", &self.plugins_added_total())
            .field("plugins_removed", &self.plugins_removed_total())
            .field("plugin_errors", &self.plugin_errors_total())
            .finish()
    }
}
