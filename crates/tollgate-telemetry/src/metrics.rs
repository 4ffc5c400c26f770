//! Prometheus metrics for the policy engine.
//!
//! Recording goes through the `metrics` facade, so the functions here are
//! no-ops until [`init_metrics`] installs the Prometheus recorder.
//!
//! # Standard Metrics
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tollgate_policy_executions_total` | Counter | `policy`, `hook`, `outcome` | Hook invocations |
//! | `tollgate_policy_duration_seconds` | Histogram | `policy`, `hook` | Hook latency |
//! | `tollgate_chain_outcomes_total` | Counter | `stream`, `outcome` | Finished chains |
//! | `tollgate_chain_length` | Histogram | `stream` | Policies per built chain |

use crate::error::TelemetryError;
use crate::TelemetryResult;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

/// Global metrics handle for rendering.
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Hook invocation counter.
pub const POLICY_EXECUTIONS_TOTAL: &str = "tollgate_policy_executions_total";
/// Hook latency histogram.
pub const POLICY_DURATION_SECONDS: &str = "tollgate_policy_duration_seconds";
/// Finished chain counter.
pub const CHAIN_OUTCOMES_TOTAL: &str = "tollgate_chain_outcomes_total";
/// Chain length histogram.
pub const CHAIN_LENGTH: &str = "tollgate_chain_length";

/// Metrics configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Whether metrics are enabled.
    pub enabled: bool,

    /// Address to expose metrics on (e.g., "0.0.0.0:9090").
    pub addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Initializes the Prometheus exporter and registers metric descriptions.
///
/// # Errors
///
/// Returns `TelemetryError::InvalidAddress` for an unparsable address and
/// `TelemetryError::MetricsInit` if the recorder cannot be installed.
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .addr
        .parse()
        .map_err(|e| TelemetryError::InvalidAddress(format!("{}: {e}", config.addr)))?;

    let handle = PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let _ = METRICS_HANDLE.set(handle);
    register_metric_descriptions();

    Ok(())
}

/// Renders metrics in Prometheus format.
///
/// Returns `None` if metrics are not initialized.
#[must_use]
pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

fn register_metric_descriptions() {
    describe_counter!(POLICY_EXECUTIONS_TOTAL, "Total policy hook invocations by outcome");
    describe_histogram!(POLICY_DURATION_SECONDS, "Policy hook duration in seconds");
    describe_counter!(CHAIN_OUTCOMES_TOTAL, "Total finished policy chains by outcome");
    describe_histogram!(CHAIN_LENGTH, "Number of policies in built chains");
}

/// Records one policy hook invocation.
///
/// * `policy` - Policy id
/// * `hook` - Hook kind name (e.g. "on_request")
/// * `outcome` - "continue", "interrupt", "error", ...
pub fn record_policy_execution(policy: &str, hook: &'static str, outcome: &'static str, duration: Duration) {
    counter!(
        POLICY_EXECUTIONS_TOTAL,
        "policy" => policy.to_string(),
        "hook" => hook,
        "outcome" => outcome
    )
    .increment(1);

    histogram!(
        POLICY_DURATION_SECONDS,
        "policy" => policy.to_string(),
        "hook" => hook
    )
    .record(duration.as_secs_f64());
}

/// Records a finished chain.
pub fn record_chain_outcome(stream: &'static str, outcome: &'static str) {
    counter!(CHAIN_OUTCOMES_TOTAL, "stream" => stream, "outcome" => outcome).increment(1);
}

/// Records the length of a freshly built chain.
pub fn record_chain_length(stream: &'static str, length: usize) {
    histogram!(CHAIN_LENGTH, "stream" => stream).record(length as f64);
}
