mod metrics;

pub use metrics::{HistogramSummary, MetricType, MetricsRecorder, MetricsSnapshot, HISTOGRAM_WINDOW};

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "ledger_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// The filter directive string built from the level and overrides.
    pub fn filter_directives(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Returned by [`init_telemetry`]; keep it alive for the life of the process.
pub struct TelemetryGuard {
    metrics_recorder: Arc<MetricsRecorder>,
    module_levels: Vec<(String, Level)>,
}

impl TelemetryGuard {
    /// Per-module log level overrides the subscriber was started with.
    pub fn module_levels(&self) -> &[(String, Level)] {
        &self.module_levels
    }

    /// Process-wide metrics recorder, shared with the store.
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        self.metrics_recorder.clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
///
/// A second call keeps the first subscriber; the returned guard still
/// carries a fresh metrics recorder.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let _ = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init();

    TelemetryGuard {
        metrics_recorder: Arc::new(MetricsRecorder::new()),
        module_levels: config.module_levels,
    }
}
