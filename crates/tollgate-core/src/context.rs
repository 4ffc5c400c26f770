//! Execution context types.
//!
//! The [`ExecutionContext`] carries the state of one HTTP exchange through a
//! policy chain: the request and response heads, phase-scoped attributes and
//! the cancellation token the host fires when the connection goes away.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A unique identifier for each exchange, using UUID v7.
///
/// UUID v7 is time-ordered, which makes it ideal for request tracking
/// and log correlation.
///
/// # Example
///
/// ```
/// use tollgate_core::RequestId;
///
/// let id = RequestId::new();
/// println!("Request ID: {}", id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Creates a new unique request ID using UUID v7.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `RequestId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// State of one HTTP exchange as seen by policies.
///
/// Bodies are not part of the context: they flow through content chains as
/// chunks. Policies read and mutate the heads and attributes; all policies
/// of one chain share the same context, one at a time.
///
/// # Example
///
/// ```
/// use tollgate_core::ExecutionContext;
///
/// let request = http::Request::builder()
///     .method("GET")
///     .uri("/orders/42")
///     .header("x-tenant", "acme")
///     .body(())
///     .unwrap();
///
/// let mut ctx = ExecutionContext::new(request);
/// ctx.set_attribute("tenant", "acme");
///
/// assert_eq!(ctx.request().uri().path(), "/orders/42");
/// assert_eq!(ctx.attribute("tenant"), Some(&serde_json::json!("acme")));
/// ```
#[derive(Debug)]
pub struct ExecutionContext {
    request_id: RequestId,
    request: http::Request<()>,
    response: http::Response<()>,
    attributes: BTreeMap<String, serde_json::Value>,
    started_at: Instant,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    /// Creates a context for the given request head.
    ///
    /// The response head starts as an empty `200 OK`.
    #[must_use]
    pub fn new(request: http::Request<()>) -> Self {
        Self {
            request_id: RequestId::new(),
            request,
            response: http::Response::new(()),
            attributes: BTreeMap::new(),
            started_at: Instant::now(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Replaces the request ID, e.g. with one propagated from a header.
    #[must_use]
    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }

    /// Uses an externally owned cancellation token.
    ///
    /// The host typically passes a child of its connection token here.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Returns the request ID.
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Returns the request head.
    #[must_use]
    pub fn request(&self) -> &http::Request<()> {
        &self.request
    }

    /// Returns the request head for modification.
    pub fn request_mut(&mut self) -> &mut http::Request<()> {
        &mut self.request
    }

    /// Returns the response head.
    #[must_use]
    pub fn response(&self) -> &http::Response<()> {
        &self.response
    }

    /// Returns the response head for modification.
    pub fn response_mut(&mut self) -> &mut http::Response<()> {
        &mut self.response
    }

    /// Replaces the response head, typically once the upstream answered.
    pub fn set_response(&mut self, response: http::Response<()>) {
        self.response = response;
    }

    /// Returns an attribute value.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name)
    }

    /// Sets an attribute, returning the previous value.
    pub fn set_attribute(
        &mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Option<serde_json::Value> {
        self.attributes.insert(name.into(), value.into())
    }

    /// Removes an attribute.
    pub fn remove_attribute(&mut self, name: &str) -> Option<serde_json::Value> {
        self.attributes.remove(name)
    }

    /// Returns all attributes, ordered by name.
    #[must_use]
    pub fn attributes(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.attributes
    }

    /// Returns when the exchange started processing.
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Returns the elapsed time since the exchange started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Returns the cancellation token of this exchange.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Aborts the exchange. Running chains stop before the next policy.
    pub fn abort(&self) {
        self.cancellation.cancel();
    }

    /// Returns true once the exchange was aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
