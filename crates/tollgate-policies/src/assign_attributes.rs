//! Context attribute assignment.
//!
//! Writes attributes into the execution context, either from a literal
//! value or copied from a header of the scoped head. Later policies read them
//! through conditions such as `#context.attributes['tenant'] == 'acme'`.

use crate::Scope;
use http::header::HeaderName;
use serde::Deserialize;
use tollgate_core::{BoxFuture, ExecutionContext, PolicyError};
use tollgate_policy::{HookRegistrar, HookResult, Policy, PolicyOutcome, PolicyScope};

/// Configuration of [`AssignAttributes`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AssignAttributesConfig {
    /// Phase the attributes are assigned in.
    pub scope: Scope,
    /// Attributes, assigned in order.
    pub attributes: Vec<AttributeEntry>,
}

/// One attribute to assign. Exactly one of `value` and `from_header` must be
/// set.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeEntry {
    /// Attribute name.
    pub name: String,
    /// Literal value.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    /// Header to copy the value from.
    #[serde(default)]
    pub from_header: Option<String>,
}

#[derive(Debug)]
enum Source {
    Literal(serde_json::Value),
    Header(HeaderName),
}

/// Assigns context attributes.
#[derive(Debug)]
pub struct AssignAttributes {
    scope: Scope,
    attributes: Vec<(String, Source)>,
}

impl AssignAttributes {
    fn assign(&self, ctx: &mut ExecutionContext) {
        for (name, source) in &self.attributes {
            let value = match source {
                Source::Literal(value) => Some(value.clone()),
                Source::Header(header) => {
                    let headers = match self.scope {
                        Scope::Request => ctx.request().headers(),
                        Scope::Response => ctx.response().headers(),
                    };
                    headers
                        .get(header)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| serde_json::Value::String(v.to_string()))
                }
            };
            match value {
                Some(value) => {
                    ctx.set_attribute(name.clone(), value);
                }
                None => tracing::debug!(attribute = %name, "Source header missing, attribute not assigned"),
            }
        }
    }

    fn on_request<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
        Box::pin(async move {
            if self.scope == Scope::Request {
                self.assign(ctx);
            }
            Ok(PolicyOutcome::Continue)
        })
    }

    fn on_response<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
        Box::pin(async move {
            if self.scope == Scope::Response {
                self.assign(ctx);
            }
            Ok(PolicyOutcome::Continue)
        })
    }
}

impl Policy for AssignAttributes {
    const ID: &'static str = "assign-attributes";
    const SCOPE: PolicyScope = PolicyScope::PerRequest;
    type Config = AssignAttributesConfig;

    fn from_config(config: AssignAttributesConfig) -> Result<Self, PolicyError> {
        let attributes = config
            .attributes
            .into_iter()
            .map(|entry| {
                if entry.name.is_empty() {
                    return Err(PolicyError::configuration("attribute name must not be empty"));
                }
                let source = match (entry.value, entry.from_header) {
                    (Some(value), None) => Source::Literal(value),
                    (None, Some(header)) => Source::Header(
                        HeaderName::from_bytes(header.as_bytes())
                            .map_err(|_| PolicyError::configuration(format!("invalid header name: {header:?}")))?,
                    ),
                    _ => {
                        return Err(PolicyError::configuration(format!(
                            "attribute {} needs exactly one of value and from_header",
                            entry.name
                        )))
                    }
                };
                Ok((entry.name, source))
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            scope: config.scope,
            attributes,
        })
    }

    fn register(hooks: &mut HookRegistrar<Self>) {
        hooks.on_request(Self::on_request).on_response(Self::on_response);
    }
}
