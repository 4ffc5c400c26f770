//! Configuration schema types.
//!
//! This module defines the structure of all configuration sections.

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// What happens when a policy condition cannot be parsed or evaluated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConditionErrorPolicy {
    /// Fail chain construction.
    #[default]
    Fail,
    /// Leave the policy out and log a warning.
    Skip,
}

/// Engine configuration section.
///
/// # Example
///
/// ```
/// use tollgate_config::{ConditionErrorPolicy, EngineConfig};
///
/// let config = EngineConfig {
///     debug: true,
///     condition_errors: ConditionErrorPolicy::Skip,
///     share_instances: true,
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Record every policy step through the debug decorator.
    #[serde(default)]
    pub debug: bool,

    /// Handling of failing conditions.
    #[serde(default)]
    pub condition_errors: ConditionErrorPolicy,

    /// Reuse instances of shared policies across exchanges.
    #[serde(default = "default_true")]
    pub share_instances: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debug: false,
            condition_errors: ConditionErrorPolicy::default(),
            share_instances: true,
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON formatted logs (production).
    #[default]
    Json,
    /// Human-readable pretty format (development).
    Pretty,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Enable logging.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Filter directive (e.g. "info" or "tollgate_policy=debug").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Emit span open and close events.
    #[serde(default)]
    pub span_events: bool,

    /// Include source file and line in logs.
    #[serde(default)]
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
            format: LogFormat::default(),
            span_events: false,
            include_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Install the Prometheus exporter.
    #[serde(default)]
    pub enabled: bool,

    /// Prometheus metrics endpoint address.
    #[serde(default = "default_metrics_addr")]
    pub addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_metrics_addr(),
        }
    }
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

/// Telemetry configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfigSection {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// A policy entry of a statically configured flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PolicyEntry {
    /// Registered policy id.
    pub name: String,

    /// Policy configuration, handed to the policy as is.
    #[serde(default = "empty_object")]
    pub configuration: serde_json::Value,

    /// Condition the policy applies under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Statically configured flow: the policies every exchange runs through.
///
/// ```toml
/// [[flow.request]]
/// name = "rate-limit"
/// configuration = { limit = 100, key_header = "x-api-key" }
///
/// [[flow.response]]
/// name = "transform-headers"
/// condition = "{#request.path matches '^/public'}"
/// configuration = { scope = "response", remove_headers = ["server"] }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct FlowConfig {
    /// Request side policies, in execution order.
    #[serde(default)]
    pub request: Vec<PolicyEntry>,

    /// Response side policies, in execution order.
    #[serde(default)]
    pub response: Vec<PolicyEntry>,
}
