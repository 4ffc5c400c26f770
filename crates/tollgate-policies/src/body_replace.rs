//! Regex replacement over a whole body.
//!
//! The body is buffered until end of stream, rewritten in one pass and
//! emitted as a single chunk. Bodies larger than `max_body_bytes` fail the
//! exchange with `413 Payload Too Large`. Since the length changes, the
//! lifecycle hook drops `content-length` from the scoped head.

use crate::Scope;
use bytes::{Bytes, BytesMut};
use http::header::CONTENT_LENGTH;
use http::StatusCode;
use regex::bytes::Regex;
use serde::Deserialize;
use tollgate_core::{BoxFuture, ExecutionContext, PolicyError, PolicyResult};
use tollgate_policy::{ContentResult, ContentStream, HookRegistrar, HookResult, Policy, PolicyOutcome, StreamSignal};

/// Key of the interruption raised for oversized bodies.
pub const PAYLOAD_TOO_LARGE_KEY: &str = "BODY_REPLACE_PAYLOAD_TOO_LARGE";

/// Attribute holding the number of replaced matches.
pub const MATCHES_ATTRIBUTE: &str = "body-replace.matches";

const fn default_max_body_bytes() -> usize {
    1024 * 1024
}

/// Configuration of [`BodyReplace`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BodyReplaceConfig {
    /// Body to rewrite.
    #[serde(default)]
    pub scope: Scope,
    /// Regular expression to search for.
    pub pattern: String,
    /// Replacement; `$1` and `$name` refer to capture groups.
    #[serde(default)]
    pub replacement: String,
    /// Largest body that is buffered.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Rewrites a body with a regular expression.
#[derive(Debug)]
pub struct BodyReplace {
    scope: Scope,
    pattern: Regex,
    replacement: String,
    max_body_bytes: usize,
}

impl BodyReplace {
    fn on_request<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
        Box::pin(async move {
            if self.scope == Scope::Request {
                ctx.request_mut().headers_mut().remove(CONTENT_LENGTH);
            }
            Ok(PolicyOutcome::Continue)
        })
    }

    fn on_response<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
        Box::pin(async move {
            if self.scope == Scope::Response {
                ctx.response_mut().headers_mut().remove(CONTENT_LENGTH);
            }
            Ok(PolicyOutcome::Continue)
        })
    }

    fn on_request_content(&self, _ctx: &mut ExecutionContext) -> ContentResult {
        Ok(self.stream_for(Scope::Request))
    }

    fn on_response_content(&self, _ctx: &mut ExecutionContext) -> ContentResult {
        Ok(self.stream_for(Scope::Response))
    }

    fn stream_for(&self, scope: Scope) -> Option<Box<dyn ContentStream>> {
        if scope != self.scope {
            return None;
        }
        Some(Box::new(ReplaceStream {
            pattern: self.pattern.clone(),
            replacement: self.replacement.clone(),
            max_body_bytes: self.max_body_bytes,
            buffer: BytesMut::new(),
        }))
    }
}

/// Buffers one body and rewrites it at end of stream.
struct ReplaceStream {
    pattern: Regex,
    replacement: String,
    max_body_bytes: usize,
    buffer: BytesMut,
}

impl ContentStream for ReplaceStream {
    fn on_chunk(&mut self, _ctx: &mut ExecutionContext, chunk: Bytes) -> Result<StreamSignal, PolicyError> {
        if self.buffer.len() + chunk.len() > self.max_body_bytes {
            self.buffer = BytesMut::new();
            return Ok(StreamSignal::Fail(
                PolicyResult::failure_with_status(StatusCode::PAYLOAD_TOO_LARGE, "Body exceeds the replacement buffer")
                    .with_key(PAYLOAD_TOO_LARGE_KEY)
                    .with_parameter("max_body_bytes", self.max_body_bytes),
            ));
        }
        self.buffer.extend_from_slice(&chunk);
        Ok(StreamSignal::Streamed)
    }

    fn on_end(&mut self, ctx: &mut ExecutionContext) -> Result<StreamSignal, PolicyError> {
        let body = std::mem::take(&mut self.buffer).freeze();
        let matches = self.pattern.find_iter(&body).count();
        ctx.set_attribute(MATCHES_ATTRIBUTE, matches);

        if body.is_empty() {
            return Ok(StreamSignal::Continue(Vec::new()));
        }
        if matches == 0 {
            return Ok(StreamSignal::chunk(body));
        }
        let replaced = self.pattern.replace_all(&body, self.replacement.as_bytes());
        Ok(StreamSignal::chunk(Bytes::from(replaced.into_owned())))
    }
}

impl Policy for BodyReplace {
    const ID: &'static str = "body-replace";
    type Config = BodyReplaceConfig;

    fn from_config(config: BodyReplaceConfig) -> Result<Self, PolicyError> {
        let pattern = Regex::new(&config.pattern)
            .map_err(|e| PolicyError::configuration(format!("invalid pattern {:?}: {e}", config.pattern)))?;
        if config.max_body_bytes == 0 {
            return Err(PolicyError::configuration("max_body_bytes must be greater than zero"));
        }
        Ok(Self {
            scope: config.scope,
            pattern,
            replacement: config.replacement,
            max_body_bytes: config.max_body_bytes,
        })
    }

    fn register(hooks: &mut HookRegistrar<Self>) {
        hooks
            .on_request(Self::on_request)
            .on_response(Self::on_response)
            .on_request_content(Self::on_request_content)
            .on_response_content(Self::on_response_content);
    }
}
