//! Lifecycle policy chains.
//!
//! A chain runs once per phase of an exchange. [`OrderedPolicyChain`] walks
//! its policies in list order; the loop in the chain decides what runs
//! next, policies only report how they finished.
//!
//! ```text
//! Idle ──execute──► Running ──all continued──► Done
//!                      │
//!                      └──fail / cancel──────► Failed
//! ```
//!
//! Driving a chain that already reached `Done` or `Failed` is a misuse and
//! fails the exchange without running anything.

use crate::content::StreamableProcessor;
use crate::error::ChainFailure;
use crate::executable::Executable;
use crate::hook::StreamType;
use bytes::Bytes;
use tollgate_core::{BoxFuture, ExecutionContext};
use tollgate_telemetry::metrics;
use tracing::Instrument;

/// Execution state of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainState {
    /// Built, not started.
    #[default]
    Idle,
    /// At least one step ran and the chain can still progress.
    Running,
    /// Every policy continued.
    Done,
    /// A policy failed or the exchange was cancelled.
    Failed,
}

impl ChainState {
    /// Returns true for `Done` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Returns the lowercase state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ChainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single-pass executor over the lifecycle hooks of one phase.
pub trait PolicyChain: Send {
    /// Runs the chain to completion.
    ///
    /// Returns the first failure; no policy after it runs.
    fn execute<'a>(&'a mut self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), ChainFailure>>;

    /// Returns the current state.
    fn state(&self) -> ChainState;

    /// Returns the stream type the chain was built for.
    fn stream_type(&self) -> StreamType;

    /// Returns the number of policies in the chain.
    fn len(&self) -> usize;

    /// Returns true for chains without policies.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of one step of an [`OrderedPolicyChain`].
enum Step {
    /// A policy continued; more may follow.
    Continue,
    /// The cursor moved past the last policy.
    Done,
}

/// Runs executables in insertion order.
pub struct OrderedPolicyChain {
    stream_type: StreamType,
    policies: Vec<Box<dyn Executable>>,
    cursor: usize,
    state: ChainState,
}

impl OrderedPolicyChain {
    /// Creates a chain over `policies`, kept in the given order.
    #[must_use]
    pub fn new(stream_type: StreamType, policies: Vec<Box<dyn Executable>>) -> Self {
        Self {
            stream_type,
            policies,
            cursor: 0,
            state: ChainState::Idle,
        }
    }

    /// Returns the policy ids in execution order.
    pub fn policy_ids(&self) -> impl Iterator<Item = &str> {
        self.policies.iter().map(|p| p.id())
    }

    /// Runs the policy under the cursor and advances.
    async fn do_next(&mut self, ctx: &mut ExecutionContext) -> Result<Step, ChainFailure> {
        // Checked before the end test too: an abort raised by the last policy
        // must not complete the chain.
        if ctx.is_aborted() {
            return Err(ChainFailure::cancelled(self.stream_type.lifecycle_hook()));
        }
        let Some(policy) = self.policies.get(self.cursor) else {
            return Ok(Step::Done);
        };
        self.cursor += 1;
        policy.execute(ctx).await.map(|()| Step::Continue)
    }

    async fn run(&mut self, ctx: &mut ExecutionContext) -> Result<(), ChainFailure> {
        self.state = ChainState::Running;
        loop {
            match self.do_next(ctx).await {
                Ok(Step::Continue) => {}
                Ok(Step::Done) => {
                    self.state = ChainState::Done;
                    tracing::debug!("Policy chain completed");
                    metrics::record_chain_outcome(self.stream_type.as_str(), "done");
                    return Ok(());
                }
                Err(failure) => {
                    self.state = ChainState::Failed;
                    tracing::warn!(
                        policy_id = failure.policy_id.as_deref().unwrap_or("-"),
                        error = %failure,
                        "Policy chain failed"
                    );
                    metrics::record_chain_outcome(self.stream_type.as_str(), failure.kind.label());
                    return Err(failure);
                }
            }
        }
    }
}

impl std::fmt::Debug for OrderedPolicyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedPolicyChain")
            .field("stream_type", &self.stream_type)
            .field("policies", &self.policy_ids().collect::<Vec<_>>())
            .field("cursor", &self.cursor)
            .field("state", &self.state)
            .finish()
    }
}

impl PolicyChain for OrderedPolicyChain {
    fn execute<'a>(&'a mut self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), ChainFailure>> {
        Box::pin(async move {
            if self.state.is_terminal() {
                return Err(ChainFailure::misuse(
                    self.stream_type.lifecycle_hook(),
                    format!("policy chain is already {}", self.state),
                ));
            }

            let span = tracing::debug_span!(
                "policy_chain",
                request_id = %ctx.request_id(),
                stream = self.stream_type.as_str(),
                chain_length = self.policies.len(),
            );
            self.run(ctx).instrument(span).await
        })
    }

    fn state(&self) -> ChainState {
        self.state
    }

    fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    fn len(&self) -> usize {
        self.policies.len()
    }
}

/// A chain without policies.
///
/// Completes immediately. Used as a lifecycle chain and as a content
/// processor that forwards every chunk unchanged.
#[derive(Debug)]
pub struct NoOpPolicyChain {
    stream_type: StreamType,
    state: ChainState,
}

impl NoOpPolicyChain {
    /// Creates an idle no-op chain.
    #[must_use]
    pub const fn new(stream_type: StreamType) -> Self {
        Self {
            stream_type,
            state: ChainState::Idle,
        }
    }

    fn misuse(&self, content: bool) -> ChainFailure {
        let hook = if content {
            self.stream_type.content_hook()
        } else {
            self.stream_type.lifecycle_hook()
        };
        ChainFailure::misuse(hook, format!("no-op chain is already {}", self.state))
    }
}

impl PolicyChain for NoOpPolicyChain {
    fn execute<'a>(&'a mut self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), ChainFailure>> {
        Box::pin(async move {
            if self.state.is_terminal() {
                return Err(self.misuse(false));
            }
            if ctx.is_aborted() {
                self.state = ChainState::Failed;
                return Err(ChainFailure::cancelled(self.stream_type.lifecycle_hook()));
            }
            self.state = ChainState::Done;
            Ok(())
        })
    }

    fn state(&self) -> ChainState {
        self.state
    }

    fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    fn len(&self) -> usize {
        0
    }
}

impl StreamableProcessor for NoOpPolicyChain {
    fn write(&mut self, ctx: &mut ExecutionContext, chunk: Bytes) -> Result<Vec<Bytes>, ChainFailure> {
        if self.state.is_terminal() {
            return Err(self.misuse(true));
        }
        if ctx.is_aborted() {
            return Err(self.cancel());
        }
        self.state = ChainState::Running;
        Ok(vec![chunk])
    }

    fn end(&mut self, ctx: &mut ExecutionContext) -> Result<Vec<Bytes>, ChainFailure> {
        if self.state.is_terminal() {
            return Err(self.misuse(true));
        }
        if ctx.is_aborted() {
            return Err(self.cancel());
        }
        self.state = ChainState::Done;
        Ok(Vec::new())
    }

    fn cancel(&mut self) -> ChainFailure {
        self.state = ChainState::Failed;
        ChainFailure::cancelled(self.stream_type.content_hook())
    }

    fn state(&self) -> ChainState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentStream;
    use crate::error::FailureKind;
    use crate::hook::HookKind;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Records its id into a shared log and optionally fails.
    struct Tracked {
        id: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    /// Aborts the exchange, then continues.
    struct Aborting;

    impl Executable for Aborting {
        fn id(&self) -> &str {
            "aborting"
        }

        fn stream_type(&self) -> StreamType {
            StreamType::OnRequest
        }

        fn execute<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), ChainFailure>> {
            Box::pin(async move {
                ctx.abort();
                Ok(())
            })
        }

        fn stream(&self, _ctx: &mut ExecutionContext) -> Result<Option<Box<dyn ContentStream>>, ChainFailure> {
            Ok(None)
        }
    }

    impl Executable for Tracked {
        fn id(&self) -> &str {
            self.id
        }

        fn stream_type(&self) -> StreamType {
            StreamType::OnRequest
        }

        fn execute<'a>(&'a self, _ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), ChainFailure>> {
            Box::pin(async move {
                self.log.lock().push(self.id);
                if self.fail {
                    Err(ChainFailure::policy(
                        self.id,
                        HookKind::OnRequest,
                        FailureKind::Error("failed".to_string()),
                    ))
                } else {
                    Ok(())
                }
            })
        }

        fn stream(&self, _ctx: &mut ExecutionContext) -> Result<Option<Box<dyn ContentStream>>, ChainFailure> {
            Ok(None)
        }
    }

    fn chain(entries: &[(&'static str, bool)]) -> (OrderedPolicyChain, Arc<Mutex<Vec<&'static str>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let policies = entries
            .iter()
            .map(|&(id, fail)| -> Box<dyn Executable> {
                Box::new(Tracked {
                    id,
                    log: Arc::clone(&log),
                    fail,
                })
            })
            .collect();
        (OrderedPolicyChain::new(StreamType::OnRequest, policies), log)
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(http::Request::new(()))
    }

    #[tokio::test]
    async fn test_runs_in_order() {
        let (mut chain, log) = chain(&[("a", false), ("b", false), ("c", false)]);
        assert_eq!(chain.state(), ChainState::Idle);

        chain.execute(&mut ctx()).await.unwrap();

        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert_eq!(chain.state(), ChainState::Done);
    }

    #[tokio::test]
    async fn test_failure_stops_chain() {
        let (mut chain, log) = chain(&[("a", false), ("b", true), ("c", false)]);

        let failure = chain.execute(&mut ctx()).await.unwrap_err();

        assert_eq!(failure.policy_id.as_deref(), Some("b"));
        assert_eq!(*log.lock(), vec!["a", "b"]);
        assert_eq!(chain.state(), ChainState::Failed);
    }

    #[tokio::test]
    async fn test_rerun_is_misuse() {
        let (mut chain, log) = chain(&[("a", false)]);
        let mut ctx = ctx();
        chain.execute(&mut ctx).await.unwrap();

        let failure = chain.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(failure.kind, FailureKind::Misuse(_)));
        assert_eq!(log.lock().len(), 1);
        assert_eq!(chain.state(), ChainState::Done);
    }

    #[tokio::test]
    async fn test_aborted_context_cancels() {
        let (mut chain, log) = chain(&[("a", false), ("b", false)]);
        let mut ctx = ctx();
        ctx.abort();

        let failure = chain.execute(&mut ctx).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Cancelled);
        assert!(log.lock().is_empty());
        assert_eq!(chain.state(), ChainState::Failed);
    }

    #[tokio::test]
    async fn test_abort_by_last_policy_cancels() {
        let mut chain = OrderedPolicyChain::new(StreamType::OnRequest, vec![Box::new(Aborting)]);
        let mut ctx = ctx();

        let failure = chain.execute(&mut ctx).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Cancelled);
        assert_eq!(failure.hook, HookKind::OnRequest);
        assert_eq!(chain.state(), ChainState::Failed);
    }

    #[tokio::test]
    async fn test_empty_ordered_chain_is_done() {
        let (mut chain, _log) = chain(&[]);
        chain.execute(&mut ctx()).await.unwrap();
        assert_eq!(chain.state(), ChainState::Done);
        assert!(chain.is_empty());
    }

    #[tokio::test]
    async fn test_noop_chain() {
        let mut chain = NoOpPolicyChain::new(StreamType::OnResponse);
        let mut ctx = ctx();

        PolicyChain::execute(&mut chain, &mut ctx).await.unwrap();
        assert_eq!(PolicyChain::state(&chain), ChainState::Done);
        assert!(PolicyChain::execute(&mut chain, &mut ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_noop_chain_on_aborted_context() {
        let mut chain = NoOpPolicyChain::new(StreamType::OnRequest);
        let mut ctx = ctx();
        ctx.abort();

        let failure = PolicyChain::execute(&mut chain, &mut ctx).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Cancelled);
        assert_eq!(failure.hook, HookKind::OnRequest);
        assert_eq!(PolicyChain::state(&chain), ChainState::Failed);
    }

    #[test]
    fn test_noop_processor_passes_chunks() {
        let mut chain = NoOpPolicyChain::new(StreamType::OnRequest);
        let mut ctx = ctx();

        assert_eq!(chain.write(&mut ctx, Bytes::from("a")).unwrap(), vec![Bytes::from("a")]);
        assert!(chain.end(&mut ctx).unwrap().is_empty());
        assert_eq!(StreamableProcessor::state(&chain), ChainState::Done);

        let failure = chain.write(&mut ctx, Bytes::from("late")).unwrap_err();
        assert_eq!(failure.hook, HookKind::OnRequestContent);
    }
}
