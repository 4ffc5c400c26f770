//! # Tollgate Policy
//!
//! Policy chain execution engine of the Tollgate gateway.
//!
//! For every exchange the engine resolves which policies apply, orders
//! them and runs them on the request and response heads, then pushes the
//! bodies through the content hooks of the same policies.
//!
//! ## Building blocks
//!
//! | Type | Role |
//! |---|---|
//! | [`Policy`] | A policy implementation and its hook registration |
//! | [`PolicyMethodResolver`] / [`MetadataCache`] | One-time hook resolution per policy type |
//! | [`ExecutablePolicy`] | Instance with hooks pre-bound for one stream type |
//! | [`PolicyManager`] | Registry, condition evaluation, instance sharing |
//! | [`OrderedPolicyChain`] / [`NoOpPolicyChain`] | Lifecycle chains |
//! | [`ContentPolicyChain`] | Streaming body pipeline |
//! | [`PolicyChainFactory`] | Builds chains, optionally with [`DebugPolicy`] decoration |
//! | [`PolicyEngine`] | Entry points for the HTTP layer |
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use tollgate_core::{BoxFuture, ExecutionContext, PolicyError};
//! use tollgate_policy::prelude::*;
//!
//! struct Hello;
//!
//! impl Hello {
//!     fn on_request<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
//!         Box::pin(async move {
//!             ctx.set_attribute("greeted", true);
//!             Ok(PolicyOutcome::Continue)
//!         })
//!     }
//! }
//!
//! impl Policy for Hello {
//!     const ID: &'static str = "hello";
//!     type Config = serde_json::Value;
//!
//!     fn from_config(_config: Self::Config) -> Result<Self, PolicyError> {
//!         Ok(Hello)
//!     }
//!
//!     fn register(hooks: &mut HookRegistrar<Self>) {
//!         hooks.on_request(Self::on_request);
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let mut manager = PolicyManager::new();
//! manager.register::<Hello>().unwrap();
//!
//! let resolver = StaticPolicyResolver::new().on_request(ResolvedPolicy::new("hello"));
//! let engine = PolicyEngine::new(Arc::new(resolver), PolicyChainFactory::new(Arc::new(manager)));
//!
//! let mut ctx = ExecutionContext::new(http::Request::new(()));
//! engine.execute_on_request(&mut ctx).await.unwrap();
//! assert_eq!(ctx.attribute("greeted"), Some(&serde_json::json!(true)));
//! # });
//! ```

#![doc(html_root_url = "https://docs.rs/tollgate-policy/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod chain;
pub mod condition;
pub mod content;
pub mod debug;
pub mod engine;
pub mod error;
pub mod executable;
pub mod factory;
pub mod hook;
pub mod manager;
pub mod metadata;

pub use chain::{ChainState, NoOpPolicyChain, OrderedPolicyChain, PolicyChain};
pub use condition::{ConditionEvaluator, ExpressionConditionEvaluator};
pub use content::{pump, ContentPolicyChain, ContentStream, StreamSignal, StreamableProcessor};
pub use debug::{DebugPolicy, DebugSink, InMemoryDebugSink, PolicyStep, StepOutcome, TracingDebugSink};
pub use engine::{PolicyEngine, PolicyResolver, StaticPolicyResolver};
pub use error::{ChainError, ChainFailure, ConditionError, FailureKind, ManagerError, ResolutionError};
pub use executable::{Executable, ExecutablePolicy};
pub use factory::{PolicyChainFactory, ResolvedPolicy};
pub use hook::{HookKind, StreamType};
pub use manager::{ConditionErrorMode, ManagerOptions, PolicyManager, PolicyPlugin, TypedPlugin};
pub use metadata::{
    ContentResult, Hook, HookRegistrar, HookResult, MetadataCache, Policy, PolicyMetadata, PolicyMethodResolver,
    PolicyOutcome, PolicyScope,
};

/// Commonly used types for writing and running policies.
pub mod prelude {
    pub use crate::{
        ContentResult, ContentStream, HookRegistrar, HookResult, Policy, PolicyChainFactory, PolicyEngine,
        PolicyManager, PolicyOutcome, PolicyScope, ResolvedPolicy, StaticPolicyResolver, StreamSignal, StreamType,
    };
}
