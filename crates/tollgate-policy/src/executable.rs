//! Executable policies.
//!
//! An [`ExecutablePolicy`] is a policy instance whose hooks for one stream
//! type were bound to it when the chain was built. Running it is a single
//! indirect call: no lookup by name, no re-resolution.

use crate::content::ContentStream;
use crate::error::{ChainFailure, FailureKind};
use crate::hook::{HookKind, StreamType};
use crate::metadata::{ContentFn, ContentResult, HookResult, LifecycleFn, Policy, PolicyMetadata, PolicyOutcome};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tollgate_core::{BoxFuture, ExecutionContext};
use tollgate_telemetry::metrics;

/// Uniform execution contract of a chain element.
pub trait Executable: Send + Sync {
    /// Returns the policy id.
    fn id(&self) -> &str;

    /// Returns the stream type the element was built for.
    fn stream_type(&self) -> StreamType;

    /// Runs the lifecycle hook of the stream type.
    ///
    /// Elements without one pass through with `Ok(())`.
    fn execute<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), ChainFailure>>;

    /// Opens the content stream of the stream type, if the policy has one.
    fn stream(&self, ctx: &mut ExecutionContext) -> Result<Option<Box<dyn ContentStream>>, ChainFailure>;
}

trait LifecycleInvoker: Send + Sync {
    fn invoke<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult>;
}

trait ContentInvoker: Send + Sync {
    fn invoke(&self, ctx: &mut ExecutionContext) -> ContentResult;
}

/// A hook handle bound to the instance it runs against.
struct Bound<P, H> {
    instance: Arc<P>,
    hook: H,
}

impl<P: Policy> LifecycleInvoker for Bound<P, LifecycleFn<P>> {
    fn invoke<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
        (*self.hook)(self.instance.as_ref(), ctx)
    }
}

impl<P: Policy> ContentInvoker for Bound<P, ContentFn<P>> {
    fn invoke(&self, ctx: &mut ExecutionContext) -> ContentResult {
        (*self.hook)(self.instance.as_ref(), ctx)
    }
}

/// A policy instance with its hooks pre-bound for one stream type.
pub struct ExecutablePolicy {
    id: String,
    stream_type: StreamType,
    lifecycle: Option<Box<dyn LifecycleInvoker>>,
    content: Option<Box<dyn ContentInvoker>>,
}

impl ExecutablePolicy {
    /// Binds the hooks of `metadata` that belong to `stream_type` to `instance`.
    #[must_use]
    pub fn new<P: Policy>(
        id: impl Into<String>,
        stream_type: StreamType,
        instance: Arc<P>,
        metadata: &PolicyMetadata<P>,
    ) -> Self {
        let lifecycle = metadata
            .lifecycle(stream_type.lifecycle_hook())
            .map(|hook| -> Box<dyn LifecycleInvoker> {
                Box::new(Bound {
                    instance: Arc::clone(&instance),
                    hook,
                })
            });
        let content = metadata
            .content(stream_type.content_hook())
            .map(|hook| -> Box<dyn ContentInvoker> { Box::new(Bound { instance, hook }) });

        Self {
            id: id.into(),
            stream_type,
            lifecycle,
            content,
        }
    }

    /// Returns true if a lifecycle hook is bound.
    #[must_use]
    pub fn has_lifecycle_hook(&self) -> bool {
        self.lifecycle.is_some()
    }

    /// Returns true if a content hook is bound.
    #[must_use]
    pub fn has_content_hook(&self) -> bool {
        self.content.is_some()
    }

    fn observe(&self, hook: HookKind, outcome: &Result<(), FailureKind>, elapsed: Duration) {
        let label = match outcome {
            Ok(()) => "continue",
            Err(kind) => kind.label(),
        };
        metrics::record_policy_execution(&self.id, hook.name(), label, elapsed);

        match outcome {
            Ok(()) => tracing::debug!(
                policy_id = %self.id,
                hook = hook.name(),
                duration_us = elapsed.as_micros() as u64,
                "Policy hook completed"
            ),
            Err(kind) => tracing::warn!(
                policy_id = %self.id,
                hook = hook.name(),
                duration_us = elapsed.as_micros() as u64,
                outcome = label,
                error = %kind,
                "Policy hook did not continue"
            ),
        }
    }
}

impl std::fmt::Debug for ExecutablePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutablePolicy")
            .field("id", &self.id)
            .field("stream_type", &self.stream_type)
            .field("lifecycle", &self.lifecycle.is_some())
            .field("content", &self.content.is_some())
            .finish()
    }
}

impl Executable for ExecutablePolicy {
    fn id(&self) -> &str {
        &self.id
    }

    fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    fn execute<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), ChainFailure>> {
        Box::pin(async move {
            let Some(invoker) = &self.lifecycle else {
                return Ok(());
            };
            let hook = self.stream_type.lifecycle_hook();
            let started = Instant::now();

            let outcome = match AssertUnwindSafe(invoker.invoke(ctx)).catch_unwind().await {
                Ok(Ok(PolicyOutcome::Continue)) => Ok(()),
                Ok(Ok(PolicyOutcome::Interrupt(result))) => Err(FailureKind::Interrupted(result)),
                Ok(Err(err)) => Err(FailureKind::Error(err.to_string())),
                Err(panic) => Err(FailureKind::Panicked(panic_message(&*panic))),
            };

            self.observe(hook, &outcome, started.elapsed());
            outcome.map_err(|kind| ChainFailure::policy(self.id.clone(), hook, kind))
        })
    }

    fn stream(&self, ctx: &mut ExecutionContext) -> Result<Option<Box<dyn ContentStream>>, ChainFailure> {
        let Some(invoker) = &self.content else {
            return Ok(None);
        };
        let hook = self.stream_type.content_hook();
        let started = Instant::now();

        let result = match std::panic::catch_unwind(AssertUnwindSafe(|| invoker.invoke(ctx))) {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(FailureKind::Error(err.to_string())),
            Err(panic) => Err(FailureKind::Panicked(panic_message(&*panic))),
        };

        let outcome = result.as_ref().map(|_| ()).map_err(FailureKind::clone);
        self.observe(hook, &outcome, started.elapsed());
        result.map_err(|kind| ChainFailure::policy(self.id.clone(), hook, kind))
    }
}

/// Extracts the message of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::StreamSignal;
    use crate::metadata::{HookRegistrar, PolicyMethodResolver};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tollgate_core::{PolicyError, PolicyResult};

    #[derive(Default)]
    struct Counting {
        requests: AtomicUsize,
    }

    impl Counting {
        fn on_request<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
            Box::pin(async move {
                let seen = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
                ctx.set_attribute("seen", seen);
                Ok(PolicyOutcome::Continue)
            })
        }
    }

    impl Policy for Counting {
        const ID: &'static str = "counting";
        type Config = ();

        fn from_config(_config: ()) -> Result<Self, PolicyError> {
            Ok(Self::default())
        }

        fn register(hooks: &mut HookRegistrar<Self>) {
            hooks.on_request(Self::on_request);
        }
    }

    struct Faulty {
        mode: &'static str,
    }

    struct Echo;

    impl ContentStream for Echo {
        fn on_chunk(&mut self, _ctx: &mut ExecutionContext, chunk: Bytes) -> Result<StreamSignal, PolicyError> {
            Ok(StreamSignal::chunk(chunk))
        }
    }

    impl Faulty {
        fn on_response<'a>(&'a self, _ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
            Box::pin(async move {
                match self.mode {
                    "interrupt" => Ok(PolicyOutcome::Interrupt(PolicyResult::failure_with_status(
                        http::StatusCode::FORBIDDEN,
                        "no",
                    ))),
                    "error" => Err(PolicyError::msg("backend down")),
                    _ => panic!("hook exploded"),
                }
            })
        }

        fn on_response_content(&self, _ctx: &mut ExecutionContext) -> ContentResult {
            match self.mode {
                "error" => Err(PolicyError::msg("cannot open")),
                "panic" => panic!("content exploded"),
                _ => Ok(Some(Box::new(Echo))),
            }
        }
    }

    impl Policy for Faulty {
        const ID: &'static str = "faulty";
        type Config = ();

        fn from_config(_config: ()) -> Result<Self, PolicyError> {
            Ok(Self { mode: "error" })
        }

        fn register(hooks: &mut HookRegistrar<Self>) {
            hooks
                .on_response(Self::on_response)
                .on_response_content(Self::on_response_content);
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(http::Request::new(()))
    }

    fn faulty(mode: &'static str) -> ExecutablePolicy {
        let metadata = PolicyMethodResolver.resolve::<Faulty>().unwrap();
        ExecutablePolicy::new("faulty", StreamType::OnResponse, Arc::new(Faulty { mode }), &metadata)
    }

    #[tokio::test]
    async fn test_bound_hook_runs_against_instance() {
        let metadata = PolicyMethodResolver.resolve::<Counting>().unwrap();
        let instance = Arc::new(Counting::default());
        let policy = ExecutablePolicy::new("counting", StreamType::OnRequest, Arc::clone(&instance), &metadata);
        let mut ctx = ctx();

        policy.execute(&mut ctx).await.unwrap();
        policy.execute(&mut ctx).await.unwrap();

        assert_eq!(instance.requests.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.attribute("seen"), Some(&serde_json::json!(2)));
    }

    #[tokio::test]
    async fn test_absent_hook_passes_through() {
        let metadata = PolicyMethodResolver.resolve::<Counting>().unwrap();
        let instance = Arc::new(Counting::default());
        let policy = ExecutablePolicy::new("counting", StreamType::OnResponse, Arc::clone(&instance), &metadata);
        let mut ctx = ctx();

        assert!(!policy.has_lifecycle_hook());
        assert!(policy.execute(&mut ctx).await.is_ok());
        assert!(policy.stream(&mut ctx).unwrap().is_none());
        assert_eq!(instance.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_interrupt_is_reported() {
        let failure = faulty("interrupt").execute(&mut ctx()).await.unwrap_err();
        assert_eq!(failure.policy_id.as_deref(), Some("faulty"));
        assert_eq!(failure.hook, HookKind::OnResponse);
        assert_eq!(failure.to_policy_result().status_code(), http::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_error_is_caught() {
        let failure = faulty("error").execute(&mut ctx()).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Error("backend down".to_string()));
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let failure = faulty("panic").execute(&mut ctx()).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Panicked("hook exploded".to_string()));
    }

    #[test]
    fn test_content_hook_failures_are_caught() {
        let failure = faulty("error").stream(&mut ctx()).err().unwrap();
        assert_eq!(failure.hook, HookKind::OnResponseContent);
        assert!(matches!(failure.kind, FailureKind::Error(_)));

        let failure = faulty("panic").stream(&mut ctx()).err().unwrap();
        assert_eq!(failure.kind, FailureKind::Panicked("content exploded".to_string()));

        assert!(faulty("interrupt").stream(&mut ctx()).unwrap().is_some());
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u32), "non-string panic payload");
    }
}
