//! Error types of the policy engine.
//!
//! | Error | Raised | Scope |
//! |---|---|---|
//! | [`ResolutionError`] | policy registration | fatal for the policy type |
//! | [`ConditionError`] | condition evaluation | one resolved policy |
//! | [`ManagerError`] | chain construction | one chain |
//! | [`ChainFailure`] | chain execution | one chain |

use crate::hook::HookKind;
use http::StatusCode;
use thiserror::Error;
use tollgate_core::PolicyResult;

/// A policy type declares hooks that cannot be used.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// A hook handle does not match the shape its kind requires.
    #[error("policy {policy} registers an incompatible handle for {hook}: expected a {expected} hook")]
    IncompatibleHook {
        /// Policy type name.
        policy: &'static str,
        /// Offending hook kind.
        hook: HookKind,
        /// Expected handle shape ("lifecycle" or "content").
        expected: &'static str,
    },

    /// The same hook kind is registered twice.
    #[error("policy {policy} registers {hook} more than once")]
    DuplicateHook {
        /// Policy type name.
        policy: &'static str,
        /// Duplicated hook kind.
        hook: HookKind,
    },
}

/// A condition expression cannot be evaluated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    /// The expression is malformed.
    #[error("invalid condition '{condition}': {reason}")]
    Parse {
        /// The condition source.
        condition: String,
        /// What went wrong.
        reason: String,
    },

    /// The expression is well-formed but cannot be evaluated.
    #[error("cannot evaluate condition '{condition}': {reason}")]
    Evaluate {
        /// The condition source.
        condition: String,
        /// What went wrong.
        reason: String,
    },
}

/// Errors raised by the policy manager.
#[derive(Error, Debug)]
pub enum ManagerError {
    /// No plugin is registered under this id.
    #[error("unknown policy: {0}")]
    UnknownPolicy(String),

    /// The configuration does not fit the policy.
    #[error("invalid configuration for policy {policy}: {reason}")]
    InvalidConfiguration {
        /// Policy id.
        policy: String,
        /// What went wrong.
        reason: String,
    },

    /// The policy type failed hook resolution.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// A plugin with this id is already registered.
    #[error("policy {0} is already registered")]
    AlreadyRegistered(String),

    /// The condition of a resolved policy failed.
    #[error("condition of policy {policy} failed: {source}")]
    Condition {
        /// Policy id.
        policy: String,
        /// Underlying error.
        #[source]
        source: ConditionError,
    },
}

/// Why a chain stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The policy interrupted the exchange on purpose.
    Interrupted(PolicyResult),
    /// The policy hook returned an error.
    Error(String),
    /// The policy hook panicked.
    Panicked(String),
    /// The exchange was aborted by the host.
    Cancelled,
    /// The chain was driven in a way its state does not allow.
    Misuse(String),
}

impl FailureKind {
    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Interrupted(_) => "interrupt",
            Self::Error(_) => "error",
            Self::Panicked(_) => "panic",
            Self::Cancelled => "cancelled",
            Self::Misuse(_) => "misuse",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupted(result) => write!(f, "interrupted with {result}"),
            Self::Error(message) => write!(f, "error: {message}"),
            Self::Panicked(message) => write!(f, "panicked: {message}"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Misuse(message) => write!(f, "chain misuse: {message}"),
        }
    }
}

/// The single failure a chain reports.
///
/// Carries the failing policy (when one is to blame), the hook that was
/// running and the cause.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{hook} chain failed{}: {kind}", policy_suffix(.policy_id.as_deref()))]
pub struct ChainFailure {
    /// The policy that failed, if the failure is attributable to one.
    pub policy_id: Option<String>,
    /// The hook being executed.
    pub hook: HookKind,
    /// The cause.
    pub kind: FailureKind,
}

fn policy_suffix(policy_id: Option<&str>) -> String {
    policy_id.map(|id| format!(" at policy {id}")).unwrap_or_default()
}

impl ChainFailure {
    /// Failure attributed to a policy.
    #[must_use]
    pub fn policy(policy_id: impl Into<String>, hook: HookKind, kind: FailureKind) -> Self {
        Self {
            policy_id: Some(policy_id.into()),
            hook,
            kind,
        }
    }

    /// Cancellation noticed between policies.
    #[must_use]
    pub const fn cancelled(hook: HookKind) -> Self {
        Self {
            policy_id: None,
            hook,
            kind: FailureKind::Cancelled,
        }
    }

    /// Chain driven after reaching a terminal state.
    #[must_use]
    pub fn misuse(hook: HookKind, message: impl Into<String>) -> Self {
        Self {
            policy_id: None,
            hook,
            kind: FailureKind::Misuse(message.into()),
        }
    }

    /// Returns true if a policy interrupted the exchange on purpose.
    #[must_use]
    pub const fn is_interruption(&self) -> bool {
        matches!(self.kind, FailureKind::Interrupted(_))
    }

    /// Maps the failure onto the result the HTTP layer answers with.
    ///
    /// Interruptions keep the policy's own result; everything else becomes
    /// a `500` without leaking the cause.
    #[must_use]
    pub fn to_policy_result(&self) -> PolicyResult {
        match &self.kind {
            FailureKind::Interrupted(result) => result.clone(),
            FailureKind::Cancelled => {
                PolicyResult::failure_with_status(StatusCode::SERVICE_UNAVAILABLE, "Request cancelled")
                    .with_key("REQUEST_CANCELLED")
            }
            FailureKind::Error(_) | FailureKind::Panicked(_) | FailureKind::Misuse(_) => {
                PolicyResult::failure("Internal Server Error").with_key("POLICY_ERROR")
            }
        }
    }
}

/// Error returned by the chain factory and the engine entry points.
#[derive(Error, Debug)]
pub enum ChainError {
    /// The chain could not be built.
    #[error("failed to build policy chain: {0}")]
    Build(#[from] ManagerError),

    /// The chain ran and failed.
    #[error(transparent)]
    Execution(#[from] ChainFailure),
}

impl ChainError {
    /// Returns the execution failure, if the chain got that far.
    #[must_use]
    pub const fn as_failure(&self) -> Option<&ChainFailure> {
        match self {
            Self::Execution(failure) => Some(failure),
            Self::Build(_) => None,
        }
    }
}
