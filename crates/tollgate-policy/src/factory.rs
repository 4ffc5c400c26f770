//! Chain construction.
//!
//! [`PolicyChainFactory`] turns the resolved policies of a flow into a
//! lifecycle chain or a content processor for one exchange. Policies whose
//! condition is false are left out; when nothing is left, the no-op
//! variant is returned.

use crate::chain::{NoOpPolicyChain, OrderedPolicyChain, PolicyChain};
use crate::content::{ContentPolicyChain, StreamableProcessor};
use crate::debug::{DebugPolicy, DebugSink};
use crate::error::{ChainError, ManagerError};
use crate::executable::Executable;
use crate::hook::StreamType;
use crate::manager::PolicyManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tollgate_core::ExecutionContext;
use tollgate_telemetry::metrics;

/// A policy selected for an exchange, as produced by flow resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPolicy {
    /// Plugin id.
    pub name: String,

    /// Configuration payload handed to the plugin.
    #[serde(default)]
    pub configuration: serde_json::Value,

    /// Optional condition; the policy only applies when it holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl ResolvedPolicy {
    /// Creates an unconditional policy with an empty configuration.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            configuration: serde_json::Value::Null,
            condition: None,
        }
    }

    /// Sets the configuration payload.
    #[must_use]
    pub fn with_configuration(mut self, configuration: serde_json::Value) -> Self {
        self.configuration = configuration;
        self
    }

    /// Sets the condition.
    #[must_use]
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// Builds policy chains and content processors.
#[derive(Clone)]
pub struct PolicyChainFactory {
    manager: Arc<PolicyManager>,
    debug: Option<Arc<dyn DebugSink>>,
}

impl PolicyChainFactory {
    /// Creates a factory backed by `manager`.
    #[must_use]
    pub fn new(manager: Arc<PolicyManager>) -> Self {
        Self { manager, debug: None }
    }

    /// Creates a factory that records every policy step into `sink`.
    #[must_use]
    pub fn debug(manager: Arc<PolicyManager>, sink: Arc<dyn DebugSink>) -> Self {
        Self {
            manager,
            debug: Some(sink),
        }
    }

    /// Returns true if the factory decorates policies for debugging.
    #[must_use]
    pub fn is_debug(&self) -> bool {
        self.debug.is_some()
    }

    /// Returns the policy manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<PolicyManager> {
        &self.manager
    }

    /// Builds the lifecycle chain of `stream_type`.
    pub fn create_chain(
        &self,
        resolved: &[ResolvedPolicy],
        stream_type: StreamType,
        ctx: &ExecutionContext,
    ) -> Result<Box<dyn PolicyChain>, ManagerError> {
        let executables = self.executables(resolved, stream_type, ctx)?;
        metrics::record_chain_length(stream_type.as_str(), executables.len());

        if executables.is_empty() {
            return Ok(Box::new(NoOpPolicyChain::new(stream_type)));
        }
        Ok(Box::new(OrderedPolicyChain::new(stream_type, executables)))
    }

    /// Builds the content processor of `stream_type`.
    ///
    /// Opens the content stream of every applicable policy; policies
    /// without a content hook for the stream type are left out.
    pub fn create_processor(
        &self,
        resolved: &[ResolvedPolicy],
        stream_type: StreamType,
        ctx: &mut ExecutionContext,
    ) -> Result<Box<dyn StreamableProcessor>, ChainError> {
        let executables = self.executables(resolved, stream_type, ctx)?;

        let mut stages = Vec::with_capacity(executables.len());
        for executable in &executables {
            if let Some(stream) = executable.stream(ctx)? {
                stages.push((executable.id().to_string(), stream));
            }
        }

        if stages.is_empty() {
            return Ok(Box::new(NoOpPolicyChain::new(stream_type)));
        }
        Ok(Box::new(ContentPolicyChain::new(stream_type, stages)))
    }

    fn executables(
        &self,
        resolved: &[ResolvedPolicy],
        stream_type: StreamType,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Box<dyn Executable>>, ManagerError> {
        let mut executables: Vec<Box<dyn Executable>> = Vec::with_capacity(resolved.len());

        for policy in resolved {
            let created = self.manager.create(
                stream_type,
                &policy.name,
                &policy.configuration,
                policy.condition.as_deref(),
                ctx,
            )?;
            let Some(executable) = created else {
                continue;
            };
            let executable: Box<dyn Executable> = match &self.debug {
                Some(sink) => Box::new(DebugPolicy::new(Box::new(executable), Arc::clone(sink))),
                None => Box::new(executable),
            };
            executables.push(executable);
        }

        Ok(executables)
    }
}

impl std::fmt::Debug for PolicyChainFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyChainFactory")
            .field("manager", &self.manager)
            .field("debug", &self.debug.is_some())
            .finish()
    }
}
