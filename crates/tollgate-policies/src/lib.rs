//! # Tollgate Policies
//!
//! Built-in policies for the Tollgate gateway.
//!
//! | Id | Hooks | Scope |
//! |---|---|---|
//! | `transform-headers` | request, response | shared |
//! | `rate-limit` | request, response | shared |
//! | `assign-attributes` | request, response | per request |
//! | `body-replace` | request, response, request content, response content | shared |
//!
//! [`register_builtin`] installs all of them into a [`PolicyManager`].
//!
//! ```
//! use tollgate_policy::PolicyManager;
//!
//! let mut manager = PolicyManager::new();
//! tollgate_policies::register_builtin(&mut manager).unwrap();
//! assert!(manager.contains("rate-limit"));
//! ```

#![doc(html_root_url = "https://docs.rs/tollgate-policies/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod assign_attributes;
pub mod body_replace;
pub mod rate_limit;
pub mod transform_headers;

pub use assign_attributes::{AssignAttributes, AssignAttributesConfig};
pub use body_replace::{BodyReplace, BodyReplaceConfig};
pub use rate_limit::{RateLimit, RateLimitConfig};
pub use transform_headers::{TransformHeaders, TransformHeadersConfig};

use serde::Deserialize;
use tollgate_policy::{ManagerError, PolicyManager, StreamType};

/// Exchange direction a policy acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// The request head or body.
    #[default]
    Request,
    /// The response head or body.
    Response,
}

impl Scope {
    /// Returns the stream type this scope runs on.
    #[must_use]
    pub const fn stream_type(self) -> StreamType {
        match self {
            Self::Request => StreamType::OnRequest,
            Self::Response => StreamType::OnResponse,
        }
    }
}

/// Registers every built-in policy under its default id.
pub fn register_builtin(manager: &mut PolicyManager) -> Result<&mut PolicyManager, ManagerError> {
    manager
        .register::<TransformHeaders>()?
        .register::<RateLimit>()?
        .register::<AssignAttributes>()?
        .register::<BodyReplace>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_builtin() {
        let mut manager = PolicyManager::new();
        register_builtin(&mut manager).unwrap();
        assert_eq!(
            manager.policy_ids(),
            vec!["assign-attributes", "body-replace", "rate-limit", "transform-headers"]
        );
    }

    #[test]
    fn test_register_builtin_twice_fails() {
        let mut manager = PolicyManager::new();
        register_builtin(&mut manager).unwrap();
        assert!(matches!(
            register_builtin(&mut manager),
            Err(ManagerError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_scope_deserializes() {
        let scope: Scope = serde_json::from_str("\"response\"").unwrap();
        assert_eq!(scope, Scope::Response);
        assert_eq!(scope.stream_type(), StreamType::OnResponse);
        assert_eq!(Scope::default(), Scope::Request);
    }
}
