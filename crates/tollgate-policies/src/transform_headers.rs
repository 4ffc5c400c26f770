//! Header rewriting.
//!
//! Removes, replaces and appends headers on the request or the response
//! head, in that order.
//!
//! ```json
//! {
//!   "scope": "request",
//!   "remove_headers": ["x-internal"],
//!   "set_headers": [{ "name": "x-gateway", "value": "tollgate" }],
//!   "add_headers": [{ "name": "via", "value": "1.1 tollgate" }]
//! }
//! ```

use crate::Scope;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use tollgate_core::{BoxFuture, ExecutionContext, PolicyError};
use tollgate_policy::{HookRegistrar, HookResult, Policy, PolicyOutcome};

/// Configuration of [`TransformHeaders`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransformHeadersConfig {
    /// Head to rewrite.
    pub scope: Scope,
    /// Headers appended next to existing values.
    pub add_headers: Vec<HeaderEntry>,
    /// Headers replacing existing values.
    pub set_headers: Vec<HeaderEntry>,
    /// Header names to drop.
    pub remove_headers: Vec<String>,
}

/// A header name and value.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderEntry {
    /// Header name.
    pub name: String,
    /// Header value.
    pub value: String,
}

/// Rewrites headers of one head.
#[derive(Debug)]
pub struct TransformHeaders {
    scope: Scope,
    add: Vec<(HeaderName, HeaderValue)>,
    set: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

impl TransformHeaders {
    /// Applies the rewrite to a header map.
    pub fn apply(&self, headers: &mut HeaderMap) {
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
        for (name, value) in &self.add {
            headers.append(name.clone(), value.clone());
        }
    }

    fn on_request<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
        Box::pin(async move {
            if self.scope == Scope::Request {
                self.apply(ctx.request_mut().headers_mut());
            }
            Ok(PolicyOutcome::Continue)
        })
    }

    fn on_response<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
        Box::pin(async move {
            if self.scope == Scope::Response {
                self.apply(ctx.response_mut().headers_mut());
            }
            Ok(PolicyOutcome::Continue)
        })
    }
}

fn header_name(name: &str) -> Result<HeaderName, PolicyError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| PolicyError::configuration(format!("invalid header name: {name:?}")))
}

fn header_entries(entries: Vec<HeaderEntry>) -> Result<Vec<(HeaderName, HeaderValue)>, PolicyError> {
    entries
        .into_iter()
        .map(|entry| {
            let name = header_name(&entry.name)?;
            let value = HeaderValue::from_str(&entry.value)
                .map_err(|_| PolicyError::configuration(format!("invalid value for header {name}")))?;
            Ok((name, value))
        })
        .collect()
}

impl Policy for TransformHeaders {
    const ID: &'static str = "transform-headers";
    type Config = TransformHeadersConfig;

    fn from_config(config: TransformHeadersConfig) -> Result<Self, PolicyError> {
        Ok(Self {
            scope: config.scope,
            add: header_entries(config.add_headers)?,
            set: header_entries(config.set_headers)?,
            remove: config
                .remove_headers
                .iter()
                .map(|name| header_name(name))
                .collect::<Result<_, _>>()?,
        })
    }

    fn register(hooks: &mut HookRegistrar<Self>) {
        hooks.on_request(Self::on_request).on_response(Self::on_response);
    }
}
