//! Streaming body pipeline.
//!
//! Content policies never see a whole body. Each one hands out a
//! [`ContentStream`] per exchange, and [`ContentPolicyChain`] pushes every
//! chunk through those streams in order. A stage may forward chunks
//! (possibly transformed), hold them back until more arrive, or fail the
//! exchange.
//!
//! ```text
//! write(chunk) ─► stage 1 ─► stage 2 ─► ... ─► stage n ─► emitted chunks
//! end()        ─► flush 1 ─► flush 2 ─► ... ─► flush n ─► trailing chunks
//! ```
//!
//! [`pump`] connects a processor to an async byte stream and an output
//! channel, stopping as soon as the exchange is cancelled.

use crate::chain::ChainState;
use crate::error::{ChainFailure, FailureKind};
use crate::executable::panic_message;
use crate::hook::{HookKind, StreamType};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;
use tollgate_core::{ExecutionContext, PolicyError, PolicyResult};
use tollgate_telemetry::metrics;

/// What a content stream did with its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    /// Forward these chunks to the next stage.
    Continue(Vec<Bytes>),
    /// Keep control and wait for more input. Nothing is forwarded.
    Streamed,
    /// Stop the exchange with this result.
    Fail(PolicyResult),
}

impl StreamSignal {
    /// Forwards a single chunk.
    #[must_use]
    pub fn chunk(chunk: Bytes) -> Self {
        Self::Continue(vec![chunk])
    }
}

/// Per-exchange body handler of a content policy.
pub trait ContentStream: Send {
    /// Handles one chunk.
    fn on_chunk(&mut self, ctx: &mut ExecutionContext, chunk: Bytes) -> Result<StreamSignal, PolicyError>;

    /// Handles end of stream, flushing anything still held.
    ///
    /// Returning [`StreamSignal::Streamed`] here is a chain misuse: there is
    /// no more input to wait for.
    fn on_end(&mut self, _ctx: &mut ExecutionContext) -> Result<StreamSignal, PolicyError> {
        Ok(StreamSignal::Continue(Vec::new()))
    }
}

/// Anything that can process a body chunk by chunk.
pub trait StreamableProcessor: Send {
    /// Feeds one chunk and returns what is ready to be sent downstream.
    fn write(&mut self, ctx: &mut ExecutionContext, chunk: Bytes) -> Result<Vec<Bytes>, ChainFailure>;

    /// Signals end of stream and returns the remaining output.
    fn end(&mut self, ctx: &mut ExecutionContext) -> Result<Vec<Bytes>, ChainFailure>;

    /// Aborts processing and drops any buffered state.
    fn cancel(&mut self) -> ChainFailure;

    /// Returns the processor state.
    fn state(&self) -> ChainState;
}

struct Stage {
    policy_id: String,
    stream: Box<dyn ContentStream>,
}

/// Ordered content stages of one exchange.
pub struct ContentPolicyChain {
    stream_type: StreamType,
    stages: Vec<Stage>,
    state: ChainState,
}

impl ContentPolicyChain {
    /// Creates a chain from `(policy id, stream)` pairs, in execution order.
    #[must_use]
    pub fn new(stream_type: StreamType, stages: Vec<(String, Box<dyn ContentStream>)>) -> Self {
        Self {
            stream_type,
            stages: stages
                .into_iter()
                .map(|(policy_id, stream)| Stage { policy_id, stream })
                .collect(),
            state: ChainState::Idle,
        }
    }

    /// Returns the number of live stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if no stage is left.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    const fn hook(&self) -> HookKind {
        self.stream_type.content_hook()
    }

    fn ensure_writable(&mut self, ctx: &ExecutionContext) -> Result<(), ChainFailure> {
        if self.state.is_terminal() {
            return Err(ChainFailure::misuse(
                self.hook(),
                format!("content chain is already {}", self.state),
            ));
        }
        if ctx.is_aborted() {
            return Err(self.cancel());
        }
        self.state = ChainState::Running;
        Ok(())
    }

    /// Pushes `input` through every stage.
    fn feed(&mut self, ctx: &mut ExecutionContext, input: Vec<Bytes>) -> Result<Vec<Bytes>, ChainFailure> {
        let mut pending = input;
        for index in 0..self.stages.len() {
            if pending.is_empty() {
                break;
            }
            pending = self.feed_stage(ctx, index, pending)?;
        }
        Ok(pending)
    }

    /// Pushes `input` through one stage.
    fn feed_stage(
        &mut self,
        ctx: &mut ExecutionContext,
        index: usize,
        input: Vec<Bytes>,
    ) -> Result<Vec<Bytes>, ChainFailure> {
        let hook = self.hook();
        let stage = &mut self.stages[index];
        let mut output = Vec::new();
        for chunk in input {
            match guarded(&stage.policy_id, hook, || stage.stream.on_chunk(ctx, chunk)) {
                Ok(StreamSignal::Continue(chunks)) => output.extend(chunks),
                Ok(StreamSignal::Streamed) => {}
                Ok(StreamSignal::Fail(result)) => {
                    let failure =
                        ChainFailure::policy(stage.policy_id.clone(), hook, FailureKind::Interrupted(result));
                    return Err(self.fail(failure));
                }
                Err(failure) => return Err(self.fail(failure)),
            }
        }
        Ok(output)
    }

    fn fail(&mut self, failure: ChainFailure) -> ChainFailure {
        self.state = ChainState::Failed;
        self.stages.clear();
        tracing::warn!(
            stream = self.stream_type.as_str(),
            policy_id = failure.policy_id.as_deref().unwrap_or("-"),
            error = %failure,
            "Content chain failed"
        );
        metrics::record_chain_outcome(self.stream_type.as_str(), failure.kind.label());
        failure
    }
}

impl std::fmt::Debug for ContentPolicyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentPolicyChain")
            .field("stream_type", &self.stream_type)
            .field("stages", &self.stages.iter().map(|s| &s.policy_id).collect::<Vec<_>>())
            .field("state", &self.state)
            .finish()
    }
}

impl StreamableProcessor for ContentPolicyChain {
    fn write(&mut self, ctx: &mut ExecutionContext, chunk: Bytes) -> Result<Vec<Bytes>, ChainFailure> {
        self.ensure_writable(ctx)?;
        self.feed(ctx, vec![chunk])
    }

    fn end(&mut self, ctx: &mut ExecutionContext) -> Result<Vec<Bytes>, ChainFailure> {
        self.ensure_writable(ctx)?;
        let hook = self.hook();
        let mut carried = Vec::new();

        for index in 0..self.stages.len() {
            // Output flushed by the previous stage goes through this one first
            let mut output = self.feed_stage(ctx, index, carried)?;

            let stage = &mut self.stages[index];
            match guarded(&stage.policy_id, hook, || stage.stream.on_end(ctx)) {
                Ok(StreamSignal::Continue(chunks)) => output.extend(chunks),
                Ok(StreamSignal::Streamed) => {
                    let failure = ChainFailure::policy(
                        stage.policy_id.clone(),
                        hook,
                        FailureKind::Misuse(HELD_AFTER_END.to_string()),
                    );
                    return Err(self.fail(failure));
                }
                Ok(StreamSignal::Fail(result)) => {
                    let failure =
                        ChainFailure::policy(stage.policy_id.clone(), hook, FailureKind::Interrupted(result));
                    return Err(self.fail(failure));
                }
                Err(failure) => return Err(self.fail(failure)),
            }
            carried = output;
        }

        self.state = ChainState::Done;
        self.stages.clear();
        tracing::debug!(stream = self.stream_type.as_str(), "Content chain completed");
        metrics::record_chain_outcome(self.stream_type.as_str(), "done");
        Ok(carried)
    }

    fn cancel(&mut self) -> ChainFailure {
        self.fail(ChainFailure::cancelled(self.hook()))
    }

    fn state(&self) -> ChainState {
        self.state
    }
}

/// Misuse message for a stream answering `Streamed` to `on_end`.
pub(crate) const HELD_AFTER_END: &str = "stream held control after end of stream";

/// Runs a content stream call, turning errors and panics into failures.
fn guarded<F>(policy_id: &str, hook: HookKind, call: F) -> Result<StreamSignal, ChainFailure>
where
    F: FnOnce() -> Result<StreamSignal, PolicyError>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(signal)) => Ok(signal),
        Ok(Err(err)) => Err(ChainFailure::policy(policy_id, hook, FailureKind::Error(err.to_string()))),
        Err(panic) => Err(ChainFailure::policy(
            policy_id,
            hook,
            FailureKind::Panicked(panic_message(&*panic)),
        )),
    }
}

/// Drives `processor` with every chunk of `input`, sending its output.
///
/// Stops with a [`FailureKind::Cancelled`] failure when the exchange's
/// cancellation token fires or when the receiving side goes away.
///
/// # Example
///
/// ```
/// # tokio_test::block_on(async {
/// use bytes::Bytes;
/// use tollgate_core::ExecutionContext;
/// use tollgate_policy::{pump, NoOpPolicyChain, StreamType};
///
/// let mut ctx = ExecutionContext::new(http::Request::new(()));
/// let mut processor = NoOpPolicyChain::new(StreamType::OnResponse);
/// let input = futures_util::stream::iter(vec![Bytes::from("a"), Bytes::from("b")]);
/// let (tx, mut rx) = tokio::sync::mpsc::channel(4);
///
/// pump(&mut processor, &mut ctx, input, &tx).await.unwrap();
/// assert_eq!(rx.recv().await.unwrap(), Bytes::from("a"));
/// assert_eq!(rx.recv().await.unwrap(), Bytes::from("b"));
/// # });
/// ```
pub async fn pump<S>(
    processor: &mut (dyn StreamableProcessor + '_),
    ctx: &mut ExecutionContext,
    mut input: S,
    output: &mpsc::Sender<Bytes>,
) -> Result<(), ChainFailure>
where
    S: Stream<Item = Bytes> + Unpin + Send,
{
    let cancellation = ctx.cancellation().clone();

    loop {
        let next = tokio::select! {
            biased;
            () = cancellation.cancelled() => return Err(processor.cancel()),
            next = input.next() => next,
        };

        let (chunks, finished) = match next {
            Some(chunk) => (processor.write(ctx, chunk)?, false),
            None => (processor.end(ctx)?, true),
        };

        for chunk in chunks {
            tokio::select! {
                biased;
                () = cancellation.cancelled() => return Err(processor.cancel()),
                sent = output.send(chunk) => {
                    if sent.is_err() {
                        tracing::debug!("Body receiver dropped, cancelling content chain");
                        return Err(processor.cancel());
                    }
                }
            }
        }

        if finished {
            return Ok(());
        }
    }
}
