//! Engines assembled from configuration files.

use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tollgate::prelude::*;
use tollgate::policy::InMemoryDebugSink;

const FLOW: &str = r#"
[engine]
condition_errors = "skip"

[[flow.request]]
name = "assign-attributes"
configuration = { attributes = [{ name = "tenant", from_header = "x-tenant" }] }

[[flow.request]]
name = "transform-headers"
condition = "{#request.path matches '^/public'}"
configuration = { set_headers = [{ name = "x-public", value = "yes" }] }

[[flow.request]]
name = "transform-headers"
condition = "{'not a boolean'}"
configuration = { set_headers = [{ name = "x-broken", value = "yes" }] }

[[flow.response]]
name = "stamp"
configuration = { value = "v1" }
"#;

#[derive(Debug, Deserialize)]
struct StampConfig {
    value: String,
}

/// Stamps the response with a fixed header.
struct Stamp {
    value: http::HeaderValue,
}

impl Stamp {
    fn on_response<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
        Box::pin(async move {
            ctx.response_mut().headers_mut().insert("x-stamp", self.value.clone());
            Ok(PolicyOutcome::Continue)
        })
    }
}

impl Policy for Stamp {
    const ID: &'static str = "stamp";
    type Config = StampConfig;

    fn from_config(config: StampConfig) -> Result<Self, PolicyError> {
        let value = http::HeaderValue::try_from(config.value).map_err(|e| PolicyError::configuration(e.to_string()))?;
        Ok(Self { value })
    }

    fn register(hooks: &mut HookRegistrar<Self>) {
        hooks.on_response(Self::on_response);
    }
}

fn config(condition_errors: &str) -> TollgateConfig {
    ConfigLoader::new()
        .with_string(FLOW, "toml")
        .unwrap()
        .with_string(&format!("[engine]\ncondition_errors = \"{condition_errors}\""), "toml")
        .unwrap()
        .load()
        .unwrap()
}

fn exchange(path: &str) -> ExecutionContext {
    let request = http::Request::builder()
        .uri(path)
        .header("x-tenant", "acme")
        .body(())
        .unwrap();
    ExecutionContext::new(request)
}

#[tokio::test]
async fn test_configured_flow_runs() {
    let sink = Arc::new(InMemoryDebugSink::new());
    let engine = EngineBuilder::new(config("skip"))
        .unwrap()
        .register::<Stamp>()
        .unwrap()
        .with_debug_sink(sink.clone())
        .build()
        .unwrap();

    let mut ctx = exchange("/public/docs");
    engine.execute_on_request(&mut ctx).await.unwrap();

    assert_eq!(ctx.attribute("tenant"), Some(&json!("acme")));
    assert_eq!(ctx.request().headers()["x-public"], "yes");
    // The policy whose condition cannot be evaluated was left out
    assert!(!ctx.request().headers().contains_key("x-broken"));

    ctx.set_response(http::Response::new(()));
    engine.execute_on_response(&mut ctx).await.unwrap();
    assert_eq!(ctx.response().headers()["x-stamp"], "v1");

    let steps: Vec<String> = sink.steps().into_iter().map(|step| step.policy_id).collect();
    assert_eq!(steps, ["assign-attributes", "transform-headers", "stamp"]);
}

#[tokio::test]
async fn test_condition_excludes_policy() {
    let engine = EngineBuilder::new(config("skip"))
        .unwrap()
        .register::<Stamp>()
        .unwrap()
        .build()
        .unwrap();

    let mut ctx = exchange("/private");
    engine.execute_on_request(&mut ctx).await.unwrap();

    assert_eq!(ctx.attribute("tenant"), Some(&json!("acme")));
    assert!(!ctx.request().headers().contains_key("x-public"));
}

#[tokio::test]
async fn test_condition_errors_fail_by_default() {
    let engine = EngineBuilder::new(config("fail"))
        .unwrap()
        .register::<Stamp>()
        .unwrap()
        .build()
        .unwrap();

    let mut ctx = exchange("/public/docs");
    assert!(engine.execute_on_request(&mut ctx).await.is_err());
    assert!(ctx.attribute("tenant").is_none());
}

#[test]
fn test_unregistered_policy_in_flow() {
    let err = EngineBuilder::new(config("skip")).unwrap().build().unwrap_err();
    assert!(matches!(err, BootstrapError::Manager(_)));
    assert!(err.to_string().contains("stamp"));
}
