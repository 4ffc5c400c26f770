//! # Tollgate
//!
//! **Policy chain execution engine for API gateways**
//!
//! Tollgate runs ordered chains of policies against every exchange passing
//! through a gateway:
//!
//! - **Lifecycle hooks** on the request and response heads, run in order
//!   until one interrupts the chain
//! - **Content hooks** that transform request and response bodies chunk by chunk
//! - **Conditions** deciding per exchange which policies take part
//! - **Shared or per-request instances**, created from JSON configuration
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate::prelude::*;
//!
//! let config = ConfigLoader::new()
//!     .with_string(
//!         r#"
//!         [[flow.request]]
//!         name = "transform-headers"
//!         configuration = { set_headers = [{ name = "x-gateway", value = "tollgate" }] }
//!         "#,
//!         "toml",
//!     )
//!     .unwrap()
//!     .load()
//!     .unwrap();
//!
//! let engine = EngineBuilder::new(config).unwrap().build().unwrap();
//! assert!(!engine.factory().is_debug());
//! ```
//!
//! ## Exchange Flow
//!
//! ```text
//! request head  → on_request chain  → request body  → content chain → upstream
//!                                                                        ↓
//! response body ← content chain ← response head ← on_response chain ←───┘
//! ```

#![doc(html_root_url = "https://docs.rs/tollgate/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod bootstrap;

// Re-export core types
pub use tollgate_core as core;

// Re-export the engine
pub use tollgate_policy as policy;

// Re-export built-in policies
pub use tollgate_policies as policies;

// Re-export configuration
pub use tollgate_config as config;

// Re-export telemetry
pub use tollgate_telemetry as telemetry;

pub use bootstrap::{init, BootstrapError, EngineBuilder};
pub use tollgate_config::{ConfigLoader, TollgateConfig};

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use tollgate::prelude::*;
/// ```
pub mod prelude {
    pub use tollgate_core::{BoxFuture, ExecutionContext, PolicyError, PolicyResult};

    pub use tollgate_policy::prelude::*;
    pub use tollgate_policy::{ChainError, ChainFailure, FailureKind, StreamableProcessor};

    pub use tollgate_config::{ConfigError, ConfigLoader, TollgateConfig};

    pub use crate::bootstrap::{init, BootstrapError, EngineBuilder};
}
