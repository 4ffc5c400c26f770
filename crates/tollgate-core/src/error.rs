//! Policy result and error types.
//!
//! A policy ends its work in one of three ways: it lets the exchange
//! continue, it interrupts the exchange with a [`PolicyResult`] (a deliberate
//! rejection such as `429 Too Many Requests`), or its hook fails with a
//! [`PolicyError`]. The chain turns both of the latter into a chain failure.

use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Structured payload describing why a policy interrupted an exchange.
///
/// The HTTP layer maps this onto the client response.
///
/// # Example
///
/// ```
/// use tollgate_core::PolicyResult;
/// use http::StatusCode;
///
/// let result = PolicyResult::failure_with_status(StatusCode::FORBIDDEN, "IP denied")
///     .with_key("IP_FILTERED");
///
/// assert_eq!(result.status_code(), StatusCode::FORBIDDEN);
/// assert_eq!(result.key(), Some("IP_FILTERED"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyResult {
    status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    parameters: BTreeMap<String, serde_json::Value>,
}

impl PolicyResult {
    /// Creates a `500 Internal Server Error` result.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self::failure_with_status(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Creates a result with an explicit status code.
    #[must_use]
    pub fn failure_with_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: status.as_u16(),
            key: None,
            message: message.into(),
            content_type: None,
            parameters: BTreeMap::new(),
        }
    }

    /// Sets the machine-readable key, e.g. `RATE_LIMIT_TOO_MANY_REQUESTS`.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Sets the content type of the message.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Adds a parameter used by response templates.
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Returns the HTTP status code.
    ///
    /// Out-of-range codes fall back to `500`.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Returns the key, if any.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Returns the message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the content type, if any.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Returns the template parameters.
    #[must_use]
    pub fn parameters(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.parameters
    }
}

impl std::fmt::Display for PolicyResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{} [{}]: {}", self.status, key, self.message),
            None => write!(f, "{}: {}", self.status, self.message),
        }
    }
}

/// Error returned by a policy hook or policy constructor.
#[derive(Error, Debug)]
pub enum PolicyError {
    /// Plain error message.
    #[error("{0}")]
    Message(String),

    /// The policy configuration is unusable.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Any other error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PolicyError {
    /// Creates an error from a message.
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_defaults_to_500() {
        let result = PolicyResult::failure("boom");
        assert_eq!(result.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(result.message(), "boom");
        assert!(result.key().is_none());
        assert!(result.content_type().is_none());
    }

    #[test]
    fn test_result_display() {
        let result = PolicyResult::failure_with_status(StatusCode::TOO_MANY_REQUESTS, "slow down")
            .with_key("RATE_LIMIT_TOO_MANY_REQUESTS");
        assert_eq!(
            result.to_string(),
            "429 [RATE_LIMIT_TOO_MANY_REQUESTS]: slow down"
        );
    }

    #[test]
    fn test_result_serialization_skips_empty_fields() {
        let result = PolicyResult::failure_with_status(StatusCode::UNAUTHORIZED, "no token");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json, serde_json::json!({"status": 401, "message": "no token"}));

        let with_params = result.with_parameter("realm", "api");
        let json = serde_json::to_value(&with_params).unwrap();
        assert_eq!(json["parameters"]["realm"], "api");
    }

    #[test]
    fn test_policy_error_display() {
        assert_eq!(PolicyError::msg("denied").to_string(), "denied");
        assert_eq!(
            PolicyError::configuration("limit must be positive").to_string(),
            "invalid configuration: limit must be positive"
        );
        let other: PolicyError = anyhow::anyhow!("io failure").into();
        assert_eq!(other.to_string(), "io failure");
    }
}
