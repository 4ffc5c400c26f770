//! Rate limiting.
//!
//! Counts requests per key in a sliding window and interrupts the exchange
//! with `429 Too Many Requests` once the limit is reached.
//!
//! ## Algorithm
//!
//! The count of the previous window is weighted by how much of the current
//! window is still ahead, then added to the current count. This smooths the
//! burst a fixed window allows at its boundary.
//!
//! ## Headers
//!
//! The request hook records the verdict in context attributes; the response
//! hook turns them into headers:
//!
//! - `x-ratelimit-limit`: Maximum requests allowed
//! - `x-ratelimit-remaining`: Remaining requests in window
//! - `x-ratelimit-reset`: Unix timestamp when the window resets
//!
//! A rejected request gets the same headers plus `retry-after` on the
//! response head before the chain is interrupted.
//!
//! The policy is shared, so every exchange resolved with the same
//! configuration counts against the same store.

use http::header::{HeaderMap, HeaderValue};
use http::StatusCode;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tollgate_core::{BoxFuture, ExecutionContext, PolicyError, PolicyResult};
use tollgate_policy::{HookRegistrar, HookResult, Policy, PolicyOutcome};

/// Rate limit header names.
pub mod headers {
    /// Maximum requests allowed in the window.
    pub const LIMIT: &str = "x-ratelimit-limit";
    /// Remaining requests in current window.
    pub const REMAINING: &str = "x-ratelimit-remaining";
    /// Unix timestamp when the window resets.
    pub const RESET: &str = "x-ratelimit-reset";
    /// Seconds to wait before retrying (on 429).
    pub const RETRY_AFTER: &str = "retry-after";
}

/// Key of the interruption raised when the limit is reached.
pub const TOO_MANY_REQUESTS_KEY: &str = "RATE_LIMIT_TOO_MANY_REQUESTS";

const ATTR_LIMIT: &str = "rate-limit.limit";
const ATTR_REMAINING: &str = "rate-limit.remaining";
const ATTR_RESET: &str = "rate-limit.reset";

fn default_window_secs() -> u64 {
    60
}

fn default_error_message() -> String {
    "Too many requests. Please try again later.".to_string()
}

/// Configuration of [`RateLimit`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Maximum number of requests allowed per window.
    pub limit: u64,

    /// Window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Header holding the client key. Without one, every request shares a
    /// single global counter.
    #[serde(default)]
    pub key_header: Option<String>,

    /// Message of the interruption.
    #[serde(default = "default_error_message")]
    pub error_message: String,

    /// Whether to expose the `x-ratelimit-*` headers.
    #[serde(default = "default_add_headers")]
    pub add_headers: bool,
}

const fn default_add_headers() -> bool {
    true
}

/// Data for a single rate limit window.
#[derive(Debug, Clone)]
struct WindowData {
    /// Number of requests in current window.
    count: u64,
    /// When the window started.
    window_start: Instant,
    /// Number of requests in previous window (for sliding calculation).
    prev_count: u64,
}

/// Windows of every key, swept at most once per window.
#[derive(Debug)]
struct WindowStore {
    windows: HashMap<String, WindowData>,
    swept_at: Instant,
}

impl WindowStore {
    fn new() -> Self {
        Self {
            windows: HashMap::new(),
            swept_at: Instant::now(),
        }
    }

    /// Drops keys idle for two windows or more. Their history no longer
    /// counts, so a dropped key restarts exactly like a kept one would.
    fn sweep(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.swept_at) < window {
            return;
        }
        let horizon = window * 2;
        self.windows
            .retain(|_, data| now.duration_since(data.window_start) < horizon);
        self.swept_at = now;
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Allowed { remaining: u64, reset_in: Duration },
    Limited { reset_in: Duration },
}

/// Sliding window rate limiter.
#[derive(Debug)]
pub struct RateLimit {
    limit: u64,
    window: Duration,
    key_header: Option<String>,
    error_message: String,
    add_headers: bool,
    store: Mutex<WindowStore>,
}

impl RateLimit {
    /// Returns the number of tracked keys.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.store.lock().windows.len()
    }

    /// Extracts the rate limit key; `None` skips limiting.
    fn extract_key(&self, ctx: &ExecutionContext) -> Option<String> {
        match &self.key_header {
            Some(name) => ctx
                .request()
                .headers()
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(String::from),
            None => Some("global".to_string()),
        }
    }

    /// Checks and updates the counter of a key.
    fn check(&self, key: &str) -> Verdict {
        let mut store = self.store.lock();
        let now = Instant::now();
        let window = self.window;

        store.sweep(now, window);
        let data = store.windows.entry(key.to_string()).or_insert_with(|| WindowData {
            count: 0,
            window_start: now,
            prev_count: 0,
        });

        let elapsed = now.duration_since(data.window_start);
        if elapsed >= window {
            let windows_passed = elapsed.as_millis() / window.as_millis();
            data.prev_count = if windows_passed >= 2 { 0 } else { data.count };
            data.count = 0;
            data.window_start = now;
        }

        // Weight the previous window by the share of the current one still ahead
        let elapsed_in_window = now.duration_since(data.window_start);
        let prev_weight = 1.0 - elapsed_in_window.as_secs_f64() / window.as_secs_f64();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let weighted = data.count + (data.prev_count as f64 * prev_weight) as u64;
        let reset_in = window.saturating_sub(elapsed_in_window);

        if weighted >= self.limit {
            Verdict::Limited { reset_in }
        } else {
            data.count += 1;
            Verdict::Allowed {
                remaining: self.limit.saturating_sub(weighted + 1),
                reset_in,
            }
        }
    }

    fn reset_timestamp(reset_in: Duration) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + reset_in.as_secs()
    }

    fn write_headers(headers: &mut HeaderMap, limit: u64, remaining: u64, reset: u64) {
        headers.insert(headers::LIMIT, HeaderValue::from(limit));
        headers.insert(headers::REMAINING, HeaderValue::from(remaining));
        headers.insert(headers::RESET, HeaderValue::from(reset));
    }

    fn on_request<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
        Box::pin(async move {
            let Some(key) = self.extract_key(ctx) else {
                return Ok(PolicyOutcome::Continue);
            };

            match self.check(&key) {
                Verdict::Allowed { remaining, reset_in } => {
                    if self.add_headers {
                        ctx.set_attribute(ATTR_LIMIT, self.limit);
                        ctx.set_attribute(ATTR_REMAINING, remaining);
                        ctx.set_attribute(ATTR_RESET, Self::reset_timestamp(reset_in));
                    }
                    Ok(PolicyOutcome::Continue)
                }
                Verdict::Limited { reset_in } => {
                    let retry_after = reset_in.as_secs().max(1);
                    tracing::debug!(key = %key, limit = self.limit, retry_after, "Rate limit exceeded");

                    let headers = ctx.response_mut().headers_mut();
                    if self.add_headers {
                        Self::write_headers(headers, self.limit, 0, Self::reset_timestamp(reset_in));
                    }
                    headers.insert(headers::RETRY_AFTER, HeaderValue::from(retry_after));

                    Ok(PolicyOutcome::Interrupt(
                        PolicyResult::failure_with_status(StatusCode::TOO_MANY_REQUESTS, self.error_message.clone())
                            .with_key(TOO_MANY_REQUESTS_KEY)
                            .with_parameter("limit", self.limit)
                            .with_parameter("retry_after", retry_after),
                    ))
                }
            }
        })
    }

    fn on_response<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
        Box::pin(async move {
            let read = |name: &str| ctx.attribute(name).and_then(serde_json::Value::as_u64);
            let verdict = (read(ATTR_LIMIT), read(ATTR_REMAINING), read(ATTR_RESET));
            if let (Some(limit), Some(remaining), Some(reset)) = verdict {
                Self::write_headers(ctx.response_mut().headers_mut(), limit, remaining, reset);
            }
            Ok(PolicyOutcome::Continue)
        })
    }
}

impl Policy for RateLimit {
    const ID: &'static str = "rate-limit";
    type Config = RateLimitConfig;

    fn from_config(config: RateLimitConfig) -> Result<Self, PolicyError> {
        if config.limit == 0 {
            return Err(PolicyError::configuration("limit must be greater than zero"));
        }
        if config.window_secs == 0 {
            return Err(PolicyError::configuration("window_secs must be greater than zero"));
        }
        Ok(Self {
            limit: config.limit,
            window: Duration::from_secs(config.window_secs),
            key_header: config.key_header,
            error_message: config.error_message,
            add_headers: config.add_headers,
            store: Mutex::new(WindowStore::new()),
        })
    }

    fn register(hooks: &mut HookRegistrar<Self>) {
        hooks.on_request(Self::on_request).on_response(Self::on_response);
    }
}
