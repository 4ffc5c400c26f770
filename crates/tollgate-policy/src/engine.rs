//! Host-facing entry points.
//!
//! The HTTP layer drives a [`PolicyEngine`] once per phase of an exchange:
//!
//! 1. `execute_on_request` before calling the upstream
//! 2. `request_content_processor` for the request body
//! 3. `execute_on_response` once the upstream answered
//! 4. `response_content_processor` for the response body
//!
//! Each call asks the [`PolicyResolver`] which policies apply, builds a
//! fresh chain through the [`PolicyChainFactory`] and, for lifecycle phases,
//! runs it.

use crate::content::StreamableProcessor;
use crate::error::ChainError;
use crate::factory::{PolicyChainFactory, ResolvedPolicy};
use crate::hook::StreamType;
use std::sync::Arc;
use tollgate_core::ExecutionContext;

/// Produces the policies that apply to an exchange.
///
/// Flow matching lives outside the engine; implementations typically match
/// the request path and method against configured flows.
pub trait PolicyResolver: Send + Sync {
    /// Returns the policies for `stream_type`, in execution order.
    fn resolve(&self, stream_type: StreamType, ctx: &ExecutionContext) -> Vec<ResolvedPolicy>;
}

/// Resolver returning fixed policy lists.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicyResolver {
    request: Vec<ResolvedPolicy>,
    response: Vec<ResolvedPolicy>,
}

impl StaticPolicyResolver {
    /// Creates a resolver without policies.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a request-side policy.
    #[must_use]
    pub fn on_request(mut self, policy: ResolvedPolicy) -> Self {
        self.request.push(policy);
        self
    }

    /// Appends a response-side policy.
    #[must_use]
    pub fn on_response(mut self, policy: ResolvedPolicy) -> Self {
        self.response.push(policy);
        self
    }
}

impl PolicyResolver for StaticPolicyResolver {
    fn resolve(&self, stream_type: StreamType, _ctx: &ExecutionContext) -> Vec<ResolvedPolicy> {
        match stream_type {
            StreamType::OnRequest => self.request.clone(),
            StreamType::OnResponse => self.response.clone(),
        }
    }
}

/// Runs the policies of every exchange phase.
#[derive(Clone)]
pub struct PolicyEngine {
    resolver: Arc<dyn PolicyResolver>,
    factory: PolicyChainFactory,
}

impl PolicyEngine {
    /// Creates an engine.
    #[must_use]
    pub fn new(resolver: Arc<dyn PolicyResolver>, factory: PolicyChainFactory) -> Self {
        Self { resolver, factory }
    }

    /// Returns the chain factory.
    #[must_use]
    pub fn factory(&self) -> &PolicyChainFactory {
        &self.factory
    }

    /// Runs the request head policies.
    pub async fn execute_on_request(&self, ctx: &mut ExecutionContext) -> Result<(), ChainError> {
        self.execute(StreamType::OnRequest, ctx).await
    }

    /// Runs the response head policies.
    pub async fn execute_on_response(&self, ctx: &mut ExecutionContext) -> Result<(), ChainError> {
        self.execute(StreamType::OnResponse, ctx).await
    }

    /// Builds the request body processor.
    pub fn request_content_processor(
        &self,
        ctx: &mut ExecutionContext,
    ) -> Result<Box<dyn StreamableProcessor>, ChainError> {
        self.processor(StreamType::OnRequest, ctx)
    }

    /// Builds the response body processor.
    pub fn response_content_processor(
        &self,
        ctx: &mut ExecutionContext,
    ) -> Result<Box<dyn StreamableProcessor>, ChainError> {
        self.processor(StreamType::OnResponse, ctx)
    }

    async fn execute(&self, stream_type: StreamType, ctx: &mut ExecutionContext) -> Result<(), ChainError> {
        let resolved = self.resolver.resolve(stream_type, ctx);
        let mut chain = self.factory.create_chain(&resolved, stream_type, ctx)?;
        chain.execute(ctx).await?;
        Ok(())
    }

    fn processor(
        &self,
        stream_type: StreamType,
        ctx: &mut ExecutionContext,
    ) -> Result<Box<dyn StreamableProcessor>, ChainError> {
        let resolved = self.resolver.resolve(stream_type, ctx);
        self.factory.create_processor(&resolved, stream_type, ctx)
    }
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("factory", &self.factory)
            .finish_non_exhaustive()
    }
}
