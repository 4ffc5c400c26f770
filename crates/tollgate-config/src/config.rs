//! Main configuration types.
//!
//! This module provides the top-level [`TollgateConfig`] struct.

use serde::{Deserialize, Serialize};

use crate::{ConfigError, EngineConfig, FlowConfig, LogFormat, TelemetryConfigSection};

/// Complete Tollgate configuration.
///
/// Use [`ConfigLoader`](crate::ConfigLoader) to load configuration from files
/// and environment variables.
///
/// # Example
///
/// ```
/// use tollgate_config::TollgateConfig;
///
/// let config = TollgateConfig::default();
/// assert!(!config.engine.debug);
/// assert!(config.flow.request.is_empty());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct TollgateConfig {
    /// Policy engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Telemetry configuration (logging, metrics).
    #[serde(default)]
    pub telemetry: TelemetryConfigSection,

    /// Statically configured flow.
    #[serde(default)]
    pub flow: FlowConfig,
}

impl TollgateConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if:
    /// - The log level is empty while logging is enabled
    /// - The metrics address is invalid while metrics are enabled
    /// - A flow entry has no policy name
    pub fn validate(&self) -> Result<(), ConfigError> {
        let logging = &self.telemetry.logging;
        if logging.enabled && logging.level.trim().is_empty() {
            return Err(ConfigError::invalid_value("telemetry.logging.level", "must not be empty"));
        }

        let metrics = &self.telemetry.metrics;
        if metrics.enabled && metrics.addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::invalid_value(
                "telemetry.metrics.addr",
                format!("invalid socket address: {}", metrics.addr),
            ));
        }

        for (section, entries) in [("flow.request", &self.flow.request), ("flow.response", &self.flow.response)] {
            if let Some(index) = entries.iter().position(|entry| entry.name.trim().is_empty()) {
                return Err(ConfigError::invalid_value(
                    format!("{section}[{index}].name"),
                    "policy name must not be empty",
                ));
            }
        }

        Ok(())
    }

    /// Create a development configuration preset.
    ///
    /// Pretty debug-level logs with span events, and the debug decorator on.
    ///
    /// # Example
    ///
    /// ```
    /// use tollgate_config::TollgateConfig;
    ///
    /// let config = TollgateConfig::development();
    /// assert!(config.engine.debug);
    /// assert_eq!(config.telemetry.logging.level, "debug");
    /// ```
    #[must_use]
    pub fn development() -> Self {
        let mut config = Self::default();

        config.engine.debug = true;
        config.telemetry.logging.level = "debug".to_string();
        config.telemetry.logging.format = LogFormat::Pretty;
        config.telemetry.logging.span_events = true;
        config.telemetry.logging.include_location = true;

        config
    }

    /// Create a production configuration preset.
    ///
    /// JSON info-level logs and the Prometheus exporter.
    ///
    /// # Example
    ///
    /// ```
    /// use tollgate_config::{LogFormat, TollgateConfig};
    ///
    /// let config = TollgateConfig::production();
    /// assert_eq!(config.telemetry.logging.format, LogFormat::Json);
    /// assert!(config.telemetry.metrics.enabled);
    /// ```
    #[must_use]
    pub fn production() -> Self {
        let mut config = Self::default();

        config.telemetry.logging.level = "info".to_string();
        config.telemetry.logging.format = LogFormat::Json;
        config.telemetry.metrics.enabled = true;

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PolicyEntry;

    #[test]
    fn test_validate_default_config() {
        assert!(TollgateConfig::default().validate().is_ok());
        assert!(TollgateConfig::development().validate().is_ok());
        assert!(TollgateConfig::production().validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_metrics_addr() {
        let mut config = TollgateConfig::default();
        config.telemetry.metrics.addr = "invalid".to_string();
        assert!(config.validate().is_ok());

        config.telemetry.metrics.enabled = true;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("metrics.addr"));
    }

    #[test]
    fn test_validate_empty_log_level() {
        let mut config = TollgateConfig::default();
        config.telemetry.logging.level = " ".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("logging.level"));

        config.telemetry.logging.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_unnamed_policy() {
        let mut config = TollgateConfig::default();
        config.flow.response.push(PolicyEntry {
            name: String::new(),
            configuration: serde_json::json!({}),
            condition: None,
        });

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("flow.response[0].name"));
    }

    #[test]
    fn test_toml_roundtrip_keeps_sections() {
        let config = TollgateConfig::development();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[engine]"));
        assert!(toml_str.contains("[telemetry.logging]"));
        assert_eq!(toml::from_str::<TollgateConfig>(&toml_str).unwrap(), config);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let toml_str = r#"
            [engine]
            debug = true
            verbose = true
        "#;
        assert!(toml::from_str::<TollgateConfig>(toml_str).is_err());
    }
}
