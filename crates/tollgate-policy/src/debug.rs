//! Debug instrumentation of policy chains.
//!
//! [`DebugPolicy`] wraps any [`Executable`] and records one [`PolicyStep`]
//! per invocation into a [`DebugSink`]. It calls the wrapped policy exactly
//! once with the same context and hands its outcome back untouched, so a
//! chain behaves the same with or without it.

use crate::content::{ContentStream, StreamSignal, HELD_AFTER_END};
use crate::error::{ChainFailure, FailureKind};
use crate::executable::{panic_message, Executable};
use crate::hook::{HookKind, StreamType};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tollgate_core::{BoxFuture, ExecutionContext, PolicyError};

/// How a recorded step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The policy continued.
    Continue,
    /// The policy stopped the chain.
    Failed(FailureKind),
}

/// Header and attribute state of the exchange at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Context attributes.
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Headers of the message the stream type works on.
    pub headers: BTreeMap<String, String>,
}

impl Snapshot {
    /// Captures the state relevant to `stream_type`.
    #[must_use]
    pub fn capture(ctx: &ExecutionContext, stream_type: StreamType) -> Self {
        let headers = match stream_type {
            StreamType::OnRequest => ctx.request().headers(),
            StreamType::OnResponse => ctx.response().headers(),
        };

        let mut captured: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in headers {
            let value = String::from_utf8_lossy(value.as_bytes());
            captured
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert_with(|| value.into_owned());
        }

        Self {
            attributes: ctx.attributes().clone(),
            headers: captured,
        }
    }
}

/// Chunk and byte counters of a content step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentCounters {
    /// Chunks received.
    pub chunks_in: usize,
    /// Chunks emitted.
    pub chunks_out: usize,
    /// Bytes received.
    pub bytes_in: usize,
    /// Bytes emitted.
    pub bytes_out: usize,
}

/// One recorded policy invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyStep {
    /// Policy id.
    pub policy_id: String,
    /// Hook that ran.
    pub hook: HookKind,
    /// How it ended.
    pub outcome: StepOutcome,
    /// Time spent in the policy.
    pub elapsed: Duration,
    /// State before the policy ran.
    pub before: Snapshot,
    /// State after the policy ran.
    pub after: Snapshot,
    /// Body counters, for content hooks.
    pub content: Option<ContentCounters>,
}

/// Receives recorded steps.
pub trait DebugSink: Send + Sync {
    /// Records a step.
    fn record(&self, step: PolicyStep);
}

/// Keeps every step in memory.
#[derive(Debug, Default)]
pub struct InMemoryDebugSink {
    steps: Mutex<Vec<PolicyStep>>,
}

impl InMemoryDebugSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the recorded steps.
    #[must_use]
    pub fn steps(&self) -> Vec<PolicyStep> {
        self.steps.lock().clone()
    }

    /// Removes and returns the recorded steps.
    pub fn take(&self) -> Vec<PolicyStep> {
        std::mem::take(&mut *self.steps.lock())
    }

    /// Returns the number of recorded steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.lock().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.lock().is_empty()
    }
}

impl DebugSink for InMemoryDebugSink {
    fn record(&self, step: PolicyStep) {
        self.steps.lock().push(step);
    }
}

/// Emits every step as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDebugSink;

impl DebugSink for TracingDebugSink {
    fn record(&self, step: PolicyStep) {
        let outcome = match &step.outcome {
            StepOutcome::Continue => "continue",
            StepOutcome::Failed(kind) => kind.label(),
        };
        let counters = step.content.unwrap_or_default();
        tracing::info!(
            target: "tollgate::debug",
            policy_id = %step.policy_id,
            hook = step.hook.name(),
            outcome,
            duration_us = step.elapsed.as_micros() as u64,
            attributes_before = step.before.attributes.len(),
            attributes_after = step.after.attributes.len(),
            headers_before = step.before.headers.len(),
            headers_after = step.after.headers.len(),
            chunks_in = counters.chunks_in,
            chunks_out = counters.chunks_out,
            bytes_in = counters.bytes_in,
            bytes_out = counters.bytes_out,
            "Policy step"
        );
    }
}

/// An executable that records its inner policy's invocations.
pub struct DebugPolicy {
    inner: Box<dyn Executable>,
    sink: Arc<dyn DebugSink>,
}

impl DebugPolicy {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Box<dyn Executable>, sink: Arc<dyn DebugSink>) -> Self {
        Self { inner, sink }
    }
}

impl std::fmt::Debug for DebugPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugPolicy").field("inner", &self.inner.id()).finish()
    }
}

impl Executable for DebugPolicy {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn stream_type(&self) -> StreamType {
        self.inner.stream_type()
    }

    fn execute<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), ChainFailure>> {
        Box::pin(async move {
            let stream_type = self.inner.stream_type();
            let before = Snapshot::capture(ctx, stream_type);
            let started = Instant::now();

            let result = self.inner.execute(ctx).await;

            self.sink.record(PolicyStep {
                policy_id: self.inner.id().to_string(),
                hook: stream_type.lifecycle_hook(),
                outcome: outcome_of(&result),
                elapsed: started.elapsed(),
                before,
                after: Snapshot::capture(ctx, stream_type),
                content: None,
            });
            result
        })
    }

    fn stream(&self, ctx: &mut ExecutionContext) -> Result<Option<Box<dyn ContentStream>>, ChainFailure> {
        let stream_type = self.inner.stream_type();
        let before = Snapshot::capture(ctx, stream_type);
        let started = Instant::now();

        match self.inner.stream(ctx) {
            Ok(Some(stream)) => Ok(Some(Box::new(DebugStream {
                inner: stream,
                policy_id: self.inner.id().to_string(),
                stream_type,
                sink: Arc::clone(&self.sink),
                before: Some(before),
                started,
                counters: ContentCounters::default(),
            }))),
            Ok(None) => Ok(None),
            Err(failure) => {
                self.sink.record(PolicyStep {
                    policy_id: self.inner.id().to_string(),
                    hook: stream_type.content_hook(),
                    outcome: StepOutcome::Failed(failure.kind.clone()),
                    elapsed: started.elapsed(),
                    before,
                    after: Snapshot::capture(ctx, stream_type),
                    content: None,
                });
                Err(failure)
            }
        }
    }
}

fn outcome_of(result: &Result<(), ChainFailure>) -> StepOutcome {
    match result {
        Ok(()) => StepOutcome::Continue,
        Err(failure) => StepOutcome::Failed(failure.kind.clone()),
    }
}

/// Content stream that counts traffic and records one step when it ends.
struct DebugStream {
    inner: Box<dyn ContentStream>,
    policy_id: String,
    stream_type: StreamType,
    sink: Arc<dyn DebugSink>,
    /// Taken when the step is recorded.
    before: Option<Snapshot>,
    started: Instant,
    counters: ContentCounters,
}

impl DebugStream {
    fn count_out(&mut self, signal: &Result<StreamSignal, PolicyError>) {
        if let Ok(StreamSignal::Continue(chunks)) = signal {
            self.counters.chunks_out += chunks.len();
            self.counters.bytes_out += chunks.iter().map(Bytes::len).sum::<usize>();
        }
    }

    fn finish(&mut self, outcome: StepOutcome, after: Snapshot) {
        let Some(before) = self.before.take() else {
            return;
        };
        self.sink.record(PolicyStep {
            policy_id: self.policy_id.clone(),
            hook: self.stream_type.content_hook(),
            outcome,
            elapsed: self.started.elapsed(),
            before,
            after,
            content: Some(self.counters),
        });
    }

    fn finish_on(&mut self, ctx: &ExecutionContext, signal: &Result<StreamSignal, PolicyError>, at_end: bool) {
        let outcome = match signal {
            Ok(StreamSignal::Fail(result)) => StepOutcome::Failed(FailureKind::Interrupted(result.clone())),
            Err(err) => StepOutcome::Failed(FailureKind::Error(err.to_string())),
            Ok(StreamSignal::Streamed) if at_end => {
                StepOutcome::Failed(FailureKind::Misuse(HELD_AFTER_END.to_string()))
            }
            Ok(_) if at_end => StepOutcome::Continue,
            Ok(_) => return,
        };
        self.finish(outcome, Snapshot::capture(ctx, self.stream_type));
    }

    /// Calls the inner stream. A panic is recorded, then unwinds on to the
    /// chain, which reports it.
    fn invoke<F>(&mut self, ctx: &mut ExecutionContext, call: F) -> Result<StreamSignal, PolicyError>
    where
        F: FnOnce(&mut dyn ContentStream, &mut ExecutionContext) -> Result<StreamSignal, PolicyError>,
    {
        let inner = &mut *self.inner;
        match std::panic::catch_unwind(AssertUnwindSafe(|| call(inner, &mut *ctx))) {
            Ok(signal) => signal,
            Err(panic) => {
                let outcome = StepOutcome::Failed(FailureKind::Panicked(panic_message(&*panic)));
                self.finish(outcome, Snapshot::capture(ctx, self.stream_type));
                std::panic::resume_unwind(panic)
            }
        }
    }
}

impl ContentStream for DebugStream {
    fn on_chunk(&mut self, ctx: &mut ExecutionContext, chunk: Bytes) -> Result<StreamSignal, PolicyError> {
        self.counters.chunks_in += 1;
        self.counters.bytes_in += chunk.len();

        let signal = self.invoke(ctx, |inner, ctx| inner.on_chunk(ctx, chunk));
        self.count_out(&signal);
        self.finish_on(ctx, &signal, false);
        signal
    }

    fn on_end(&mut self, ctx: &mut ExecutionContext) -> Result<StreamSignal, PolicyError> {
        let signal = self.invoke(ctx, |inner, ctx| inner.on_end(ctx));
        self.count_out(&signal);
        self.finish_on(ctx, &signal, true);
        signal
    }
}

impl Drop for DebugStream {
    fn drop(&mut self) {
        // Dropped before end of stream: the chain was cancelled or another stage failed
        if let Some(before) = self.before.clone() {
            self.finish(StepOutcome::Failed(FailureKind::Cancelled), before);
        }
    }
}
