//! Typed configuration for Tollgate.
//!
//! This crate provides the strongly-typed configuration of a Tollgate engine
//! with support for:
//! - TOML and JSON configuration files
//! - Environment variable overrides, optionally read from a `.env` file
//! - Strict validation (fails on unknown fields)
//! - Layered configuration (preset → files → env)
//!
//! # Overview
//!
//! [`TollgateConfig`] holds three sections:
//!
//! - [`EngineConfig`] - condition error handling, instance sharing, debug recording
//! - [`TelemetryConfigSection`] - logging and metrics
//! - [`FlowConfig`] - the statically configured request and response policies
//!
//! # Example
//!
//! ```no_run
//! use tollgate_config::ConfigLoader;
//!
//! # fn main() -> Result<(), tollgate_config::ConfigError> {
//! let config = ConfigLoader::new()
//!     .with_production()
//!     .with_optional_file("tollgate.toml")?
//!     .with_env_prefix("TOLLGATE")
//!     .load()?;
//!
//! println!("{} request policies", config.flow.request.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration File Format
//!
//! ```toml
//! [engine]
//! debug = false
//! condition_errors = "fail"
//! share_instances = true
//!
//! [telemetry.logging]
//! level = "info"
//! format = "json"
//!
//! [telemetry.metrics]
//! enabled = true
//! addr = "0.0.0.0:9090"
//!
//! [[flow.request]]
//! name = "rate-limit"
//! configuration = { limit = 100, key_header = "x-api-key" }
//!
//! [[flow.response]]
//! name = "transform-headers"
//! configuration = { scope = "response", remove_headers = ["server"] }
//! ```
//!
//! # Environment Variable Overrides
//!
//! Scalar settings can be overridden with variables of the form
//! `PREFIX__SECTION__KEY`:
//!
//! - `TOLLGATE__ENGINE__CONDITION_ERRORS=skip`
//! - `TOLLGATE__TELEMETRY__LOGGING__LEVEL=tollgate_policy=debug`
//! - `TOLLGATE__TELEMETRY__METRICS__ENABLED=false`

#![warn(missing_docs)]

mod config;
mod error;
mod loader;
mod schema;

pub use config::*;
pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::*;
