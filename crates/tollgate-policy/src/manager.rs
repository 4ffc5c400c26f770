//! Policy registry and instantiation.
//!
//! [`PolicyManager`] knows every installed policy plugin by id. For each
//! resolved policy of a flow it evaluates the condition, builds (or reuses)
//! an instance from the configuration and returns an [`ExecutablePolicy`]
//! bound to the cached metadata of the policy type.

use crate::condition::{ConditionEvaluator, ExpressionConditionEvaluator};
use crate::error::ManagerError;
use crate::executable::ExecutablePolicy;
use crate::hook::{HookKind, StreamType};
use crate::metadata::{MetadataCache, Policy, PolicyMetadata, PolicyScope};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tollgate_core::ExecutionContext;

/// What to do when a condition cannot be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConditionErrorMode {
    /// Fail chain construction.
    #[default]
    Fail,
    /// Leave the policy out and log a warning.
    Skip,
}

/// Behavior switches of a [`PolicyManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerOptions {
    /// Handling of condition errors.
    pub condition_errors: ConditionErrorMode,
    /// Reuse instances of shared policies across exchanges.
    pub share_instances: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            condition_errors: ConditionErrorMode::Fail,
            share_instances: true,
        }
    }
}

/// An installed policy type, erased.
pub trait PolicyPlugin: Send + Sync {
    /// Returns the id the plugin is registered under.
    fn id(&self) -> &str;

    /// Returns the instance sharing strategy.
    fn scope(&self) -> PolicyScope;

    /// Returns the Rust type name of the policy.
    fn type_name(&self) -> &'static str;

    /// Returns the hooks the policy implements.
    fn hook_kinds(&self) -> BTreeSet<HookKind>;

    /// Builds an executable for `stream_type` from a configuration payload.
    ///
    /// With `share` set, shared-scope plugins reuse the instance built for
    /// an identical configuration.
    fn create(
        &self,
        stream_type: StreamType,
        configuration: &serde_json::Value,
        share: bool,
    ) -> Result<ExecutablePolicy, ManagerError>;
}

/// [`PolicyPlugin`] of a concrete policy type.
pub struct TypedPlugin<P: Policy> {
    id: String,
    metadata: Arc<PolicyMetadata<P>>,
    instances: DashMap<String, Arc<P>>,
}

impl<P: Policy> TypedPlugin<P> {
    /// Resolves the metadata of `P` and wraps it as a plugin.
    pub fn new(id: impl Into<String>) -> Result<Self, ManagerError> {
        Ok(Self {
            id: id.into(),
            metadata: MetadataCache::global().resolve::<P>()?,
            instances: DashMap::new(),
        })
    }

    /// Returns the number of cached shared instances.
    #[must_use]
    pub fn cached_instances(&self) -> usize {
        self.instances.len()
    }

    fn instantiate(&self, configuration: &serde_json::Value) -> Result<P, ManagerError> {
        let invalid = |reason: String| ManagerError::InvalidConfiguration {
            policy: self.id.clone(),
            reason,
        };
        // A missing configuration reads as an empty object
        let payload = match configuration {
            serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
            other => other.clone(),
        };
        let config = serde_json::from_value::<P::Config>(payload).map_err(|e| invalid(e.to_string()))?;
        P::from_config(config).map_err(|e| invalid(e.to_string()))
    }

    fn shared(&self, configuration: &serde_json::Value) -> Result<Arc<P>, ManagerError> {
        // Object keys serialize sorted, so equal configurations share a key
        let key = configuration.to_string();
        let cached = self.instances.get(&key).map(|entry| Arc::clone(entry.value()));
        if let Some(instance) = cached {
            return Ok(instance);
        }

        let built = Arc::new(self.instantiate(configuration)?);
        tracing::debug!(policy_id = %self.id, "Created shared policy instance");
        Ok(Arc::clone(self.instances.entry(key).or_insert(built).value()))
    }
}

impl<P: Policy> PolicyPlugin for TypedPlugin<P> {
    fn id(&self) -> &str {
        &self.id
    }

    fn scope(&self) -> PolicyScope {
        P::SCOPE
    }

    fn type_name(&self) -> &'static str {
        self.metadata.type_name()
    }

    fn hook_kinds(&self) -> BTreeSet<HookKind> {
        self.metadata.hook_kinds()
    }

    fn create(
        &self,
        stream_type: StreamType,
        configuration: &serde_json::Value,
        share: bool,
    ) -> Result<ExecutablePolicy, ManagerError> {
        let instance = if share && P::SCOPE == PolicyScope::Shared {
            self.shared(configuration)?
        } else {
            Arc::new(self.instantiate(configuration)?)
        };
        Ok(ExecutablePolicy::new(self.id.clone(), stream_type, instance, &self.metadata))
    }
}

/// Registry of installed policies.
///
/// # Example
///
/// ```ignore
/// let mut manager = PolicyManager::new();
/// manager.register::<RateLimit>()?;
///
/// let executable = manager.create(
///     StreamType::OnRequest,
///     "rate-limit",
///     &json!({ "limit": 100, "window_secs": 60 }),
///     None,
///     &ctx,
/// )?;
/// ```
pub struct PolicyManager {
    plugins: HashMap<String, Arc<dyn PolicyPlugin>>,
    conditions: Arc<dyn ConditionEvaluator>,
    options: ManagerOptions,
}

impl PolicyManager {
    /// Creates an empty manager with the expression condition evaluator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
            conditions: Arc::new(ExpressionConditionEvaluator::new()),
            options: ManagerOptions::default(),
        }
    }

    /// Sets the manager options.
    #[must_use]
    pub fn with_options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the condition evaluator.
    #[must_use]
    pub fn with_condition_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.conditions = evaluator;
        self
    }

    /// Returns the manager options.
    #[must_use]
    pub fn options(&self) -> ManagerOptions {
        self.options
    }

    /// Registers `P` under its own id.
    ///
    /// Hook resolution happens here, so broken policy types are rejected at
    /// startup.
    pub fn register<P: Policy>(&mut self) -> Result<&mut Self, ManagerError> {
        self.register_as::<P>(P::ID)
    }

    /// Registers `P` under a custom id.
    pub fn register_as<P: Policy>(&mut self, id: impl Into<String>) -> Result<&mut Self, ManagerError> {
        let plugin = TypedPlugin::<P>::new(id)?;
        self.install(Arc::new(plugin))
    }

    /// Installs an already built plugin.
    pub fn install(&mut self, plugin: Arc<dyn PolicyPlugin>) -> Result<&mut Self, ManagerError> {
        let id = plugin.id().to_string();
        if self.plugins.contains_key(&id) {
            return Err(ManagerError::AlreadyRegistered(id));
        }
        tracing::debug!(
            policy_id = %id,
            policy_type = plugin.type_name(),
            hooks = ?plugin.hook_kinds(),
            "Registered policy"
        );
        self.plugins.insert(id, plugin);
        Ok(self)
    }

    /// Returns true if a plugin is registered under `id`.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.plugins.contains_key(id)
    }

    /// Returns the plugin registered under `id`.
    #[must_use]
    pub fn plugin(&self, id: &str) -> Option<&Arc<dyn PolicyPlugin>> {
        self.plugins.get(id)
    }

    /// Returns the registered ids, sorted.
    #[must_use]
    pub fn policy_ids(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self.plugins.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Produces the executable of one resolved policy.
    ///
    /// The condition is evaluated first; a blank condition counts as none.
    /// Returns `Ok(None)` when the policy does not apply to this exchange.
    pub fn create(
        &self,
        stream_type: StreamType,
        policy_id: &str,
        configuration: &serde_json::Value,
        condition: Option<&str>,
        ctx: &ExecutionContext,
    ) -> Result<Option<ExecutablePolicy>, ManagerError> {
        if let Some(condition) = condition.map(str::trim).filter(|c| !c.is_empty()) {
            match self.conditions.evaluate(condition, ctx) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(policy_id, condition, "Policy skipped by condition");
                    return Ok(None);
                }
                Err(source) => match self.options.condition_errors {
                    ConditionErrorMode::Fail => {
                        return Err(ManagerError::Condition {
                            policy: policy_id.to_string(),
                            source,
                        });
                    }
                    ConditionErrorMode::Skip => {
                        tracing::warn!(policy_id, error = %source, "Skipping policy with failing condition");
                        return Ok(None);
                    }
                },
            }
        }

        let plugin = self
            .plugins
            .get(policy_id)
            .ok_or_else(|| ManagerError::UnknownPolicy(policy_id.to_string()))?;

        plugin
            .create(stream_type, configuration, self.options.share_instances)
            .map(Some)
    }
}

impl Default for PolicyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PolicyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyManager")
            .field("plugins", &self.policy_ids())
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConditionError;
    use crate::executable::Executable;
    use crate::metadata::{HookRegistrar, HookResult, PolicyOutcome};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tollgate_core::{BoxFuture, PolicyError};

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct TagConfig {
        tag: String,
    }

    struct Tag {
        tag: String,
    }

    impl Tag {
        fn on_request<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
            Box::pin(async move {
                ctx.set_attribute("tag", self.tag.clone());
                Ok(PolicyOutcome::Continue)
            })
        }
    }

    impl Policy for Tag {
        const ID: &'static str = "tag";
        type Config = TagConfig;

        fn from_config(config: TagConfig) -> Result<Self, PolicyError> {
            if config.tag.is_empty() {
                return Err(PolicyError::configuration("tag must not be empty"));
            }
            Ok(Self { tag: config.tag })
        }

        fn register(hooks: &mut HookRegistrar<Self>) {
            hooks.on_request(Self::on_request);
        }
    }

    struct Fresh;

    impl Policy for Fresh {
        const ID: &'static str = "fresh";
        const SCOPE: PolicyScope = PolicyScope::PerRequest;
        type Config = serde_json::Value;

        fn from_config(_config: serde_json::Value) -> Result<Self, PolicyError> {
            Ok(Fresh)
        }

        fn register(_hooks: &mut HookRegistrar<Self>) {}
    }

    /// Only used by `test_share_instances_option`, which owns the counter.
    static COUNTED: AtomicUsize = AtomicUsize::new(0);

    struct Counted;

    impl Policy for Counted {
        const ID: &'static str = "counted";
        type Config = serde_json::Value;

        fn from_config(_config: serde_json::Value) -> Result<Self, PolicyError> {
            COUNTED.fetch_add(1, Ordering::SeqCst);
            Ok(Counted)
        }

        fn register(_hooks: &mut HookRegistrar<Self>) {}
    }

    struct Broken;

    impl Policy for Broken {
        const ID: &'static str = "broken";
        type Config = ();

        fn from_config(_config: ()) -> Result<Self, PolicyError> {
            Ok(Broken)
        }

        fn register(hooks: &mut HookRegistrar<Self>) {
            hooks.on_response_content(|_, _| Ok(None)).on_response_content(|_, _| Ok(None));
        }
    }

    /// Counts evaluations and answers with a fixed result.
    struct FixedCondition {
        result: Result<bool, ConditionError>,
        calls: AtomicUsize,
    }

    impl ConditionEvaluator for FixedCondition {
        fn evaluate(&self, _condition: &str, _ctx: &ExecutionContext) -> Result<bool, ConditionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn manager() -> PolicyManager {
        let mut manager = PolicyManager::new();
        manager.register::<Tag>().unwrap().register::<Fresh>().unwrap();
        manager
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(http::Request::new(()))
    }

    #[tokio::test]
    async fn test_create_binds_configured_instance() {
        let manager = manager();
        let mut ctx = ctx();

        let policy = manager
            .create(StreamType::OnRequest, "tag", &json!({"tag": "blue"}), None, &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(policy.id(), "tag");
        policy.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.attribute("tag"), Some(&json!("blue")));
    }

    #[test]
    fn test_share_instances_option() {
        let ctx = ctx();
        let config = json!({"window": 10});

        let mut shared = PolicyManager::new();
        shared.register::<Counted>().unwrap();
        for _ in 0..3 {
            shared.create(StreamType::OnRequest, "counted", &config, None, &ctx).unwrap();
        }
        assert_eq!(COUNTED.load(Ordering::SeqCst), 1);

        let mut unshared = PolicyManager::new().with_options(ManagerOptions {
            share_instances: false,
            ..ManagerOptions::default()
        });
        unshared.register::<Counted>().unwrap();
        for _ in 0..2 {
            unshared.create(StreamType::OnRequest, "counted", &config, None, &ctx).unwrap();
        }
        assert_eq!(COUNTED.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_typed_plugin_caches_by_configuration() {
        let plugin = TypedPlugin::<Tag>::new("tag").unwrap();
        for tag in ["a", "a", "b", "a"] {
            plugin.create(StreamType::OnRequest, &json!({"tag": tag}), true).unwrap();
        }
        assert_eq!(plugin.cached_instances(), 2);

        plugin.create(StreamType::OnRequest, &json!({"tag": "c"}), false).unwrap();
        assert_eq!(plugin.cached_instances(), 2);
    }

    #[test]
    fn test_per_request_plugins_are_never_cached() {
        let plugin = TypedPlugin::<Fresh>::new("fresh").unwrap();
        plugin.create(StreamType::OnResponse, &json!({}), true).unwrap();
        plugin.create(StreamType::OnResponse, &json!({}), true).unwrap();
        assert_eq!(plugin.cached_instances(), 0);
    }

    #[test]
    fn test_unknown_policy() {
        let err = manager()
            .create(StreamType::OnRequest, "missing", &json!({}), None, &ctx())
            .unwrap_err();
        assert!(matches!(err, ManagerError::UnknownPolicy(id) if id == "missing"));
    }

    #[test]
    fn test_invalid_configuration() {
        let manager = manager();
        let ctx = ctx();

        let err = manager
            .create(StreamType::OnRequest, "tag", &json!({"color": "red"}), None, &ctx)
            .unwrap_err();
        assert!(matches!(err, ManagerError::InvalidConfiguration { .. }));

        let err = manager
            .create(StreamType::OnRequest, "tag", &json!({"tag": ""}), None, &ctx)
            .unwrap_err();
        assert!(err.to_string().contains("tag must not be empty"));

        let err = manager
            .create(StreamType::OnRequest, "tag", &serde_json::Value::Null, None, &ctx)
            .unwrap_err();
        assert!(err.to_string().contains("missing field `tag`"));
    }

    #[test]
    fn test_duplicate_registration() {
        let mut manager = manager();
        assert!(matches!(
            manager.register::<Tag>(),
            Err(ManagerError::AlreadyRegistered(id)) if id == "tag"
        ));
    }

    #[test]
    fn test_broken_policy_rejected_at_registration() {
        let mut manager = PolicyManager::new();
        assert!(matches!(manager.register::<Broken>(), Err(ManagerError::Resolution(_))));
        assert!(!manager.contains("broken"));
    }

    #[test]
    fn test_false_condition_skips_before_lookup() {
        let manager = manager();
        let ctx = ctx();
        let skipped = manager
            .create(StreamType::OnRequest, "missing", &json!({}), Some("false"), &ctx)
            .unwrap();
        assert!(skipped.is_none());
    }

    #[test]
    fn test_blank_condition_is_absent() {
        let evaluator = Arc::new(FixedCondition {
            result: Ok(false),
            calls: AtomicUsize::new(0),
        });
        let mut manager = PolicyManager::new().with_condition_evaluator(evaluator.clone());
        manager.register::<Fresh>().unwrap();

        let created = manager
            .create(StreamType::OnRequest, "fresh", &json!({}), Some("   "), &ctx())
            .unwrap();
        assert!(created.is_some());
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_condition_error_modes() {
        let failing = || {
            Arc::new(FixedCondition {
                result: Err(ConditionError::Parse {
                    condition: "#bad".to_string(),
                    reason: "unknown reference".to_string(),
                }),
                calls: AtomicUsize::new(0),
            })
        };
        let ctx = ctx();

        let mut strict = PolicyManager::new().with_condition_evaluator(failing());
        strict.register::<Fresh>().unwrap();
        let err = strict
            .create(StreamType::OnRequest, "fresh", &json!({}), Some("#bad"), &ctx)
            .unwrap_err();
        assert!(matches!(err, ManagerError::Condition { ref policy, .. } if policy == "fresh"));

        let mut lenient = PolicyManager::new()
            .with_condition_evaluator(failing())
            .with_options(ManagerOptions {
                condition_errors: ConditionErrorMode::Skip,
                share_instances: true,
            });
        lenient.register::<Fresh>().unwrap();
        let skipped = lenient
            .create(StreamType::OnRequest, "fresh", &json!({}), Some("#bad"), &ctx)
            .unwrap();
        assert!(skipped.is_none());
    }

    #[test]
    fn test_policy_ids_sorted() {
        assert_eq!(manager().policy_ids(), vec!["fresh", "tag"]);
    }
}
