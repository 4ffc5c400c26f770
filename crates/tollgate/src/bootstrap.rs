//! Turning a [`TollgateConfig`] into a running engine.

use std::sync::Arc;

use thiserror::Error;
use tollgate_config::{
    ConditionErrorPolicy, ConfigError, EngineConfig, FlowConfig, LogFormat, PolicyEntry, TelemetryConfigSection,
    TollgateConfig,
};
use tollgate_policy::{
    ConditionErrorMode, DebugSink, ManagerError, ManagerOptions, Policy, PolicyChainFactory, PolicyEngine,
    PolicyManager, ResolvedPolicy, StaticPolicyResolver, TracingDebugSink,
};
use tollgate_telemetry::{LogConfig, MetricsConfig, TelemetryConfig, TelemetryError};

/// Errors raised while assembling an engine.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Telemetry could not be initialized.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    /// A policy could not be registered, or the flow names an unknown one.
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

/// Maps the engine section onto manager options.
#[must_use]
pub fn manager_options(config: &EngineConfig) -> ManagerOptions {
    ManagerOptions {
        condition_errors: match config.condition_errors {
            ConditionErrorPolicy::Fail => ConditionErrorMode::Fail,
            ConditionErrorPolicy::Skip => ConditionErrorMode::Skip,
        },
        share_instances: config.share_instances,
    }
}

/// Maps the telemetry section onto the telemetry subsystem configuration.
#[must_use]
pub fn telemetry_config(section: &TelemetryConfigSection) -> TelemetryConfig {
    let logging = &section.logging;
    TelemetryConfig {
        logging: LogConfig {
            enabled: logging.enabled,
            level: logging.level.clone(),
            json_format: logging.format == LogFormat::Json,
            span_events: logging.span_events,
            file_line_info: logging.include_location,
            include_target: true,
        },
        metrics: MetricsConfig {
            enabled: section.metrics.enabled,
            addr: section.metrics.addr.clone(),
        },
    }
}

/// Builds a resolver serving the configured flow to every exchange.
#[must_use]
pub fn resolver(flow: &FlowConfig) -> StaticPolicyResolver {
    let request = flow.request.iter().map(resolved);
    let response = flow.response.iter().map(resolved);

    let resolver = request.fold(StaticPolicyResolver::new(), StaticPolicyResolver::on_request);
    response.fold(resolver, StaticPolicyResolver::on_response)
}

fn resolved(entry: &PolicyEntry) -> ResolvedPolicy {
    let policy = ResolvedPolicy::new(entry.name.as_str()).with_configuration(entry.configuration.clone());
    match &entry.condition {
        Some(condition) => policy.with_condition(condition.as_str()),
        None => policy,
    }
}

/// Assembles a [`PolicyEngine`] from configuration.
///
/// The built-in policies are registered up front; further policies can be
/// added before [`build`](Self::build).
///
/// # Example
///
/// ```
/// use tollgate::{EngineBuilder, TollgateConfig};
///
/// let engine = EngineBuilder::new(TollgateConfig::default())
///     .unwrap()
///     .build()
///     .unwrap();
/// assert!(!engine.factory().is_debug());
/// ```
pub struct EngineBuilder {
    config: TollgateConfig,
    manager: PolicyManager,
    debug_sink: Option<Arc<dyn DebugSink>>,
}

impl EngineBuilder {
    /// Creates a builder with the built-in policies registered.
    ///
    /// # Errors
    ///
    /// Returns `BootstrapError::Manager` if registration fails.
    pub fn new(config: TollgateConfig) -> Result<Self, BootstrapError> {
        let mut manager = PolicyManager::new().with_options(manager_options(&config.engine));
        tollgate_policies::register_builtin(&mut manager)?;

        Ok(Self {
            config,
            manager,
            debug_sink: None,
        })
    }

    /// Registers an additional policy.
    ///
    /// # Errors
    ///
    /// Returns `BootstrapError::Manager` if the id is taken or the policy's
    /// hooks do not resolve.
    pub fn register<P: Policy>(mut self) -> Result<Self, BootstrapError> {
        self.manager.register::<P>()?;
        Ok(self)
    }

    /// Records policy steps into `sink`, regardless of `engine.debug`.
    #[must_use]
    pub fn with_debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.debug_sink = Some(sink);
        self
    }

    /// Builds the engine.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::UnknownPolicy` if the flow names a policy that
    /// was never registered.
    pub fn build(self) -> Result<PolicyEngine, BootstrapError> {
        let flow = &self.config.flow;
        if let Some(entry) = flow
            .request
            .iter()
            .chain(&flow.response)
            .find(|entry| !self.manager.contains(&entry.name))
        {
            return Err(ManagerError::UnknownPolicy(entry.name.clone()).into());
        }

        let sink = self.debug_sink.or_else(|| {
            self.config
                .engine
                .debug
                .then(|| Arc::new(TracingDebugSink) as Arc<dyn DebugSink>)
        });

        let manager = Arc::new(self.manager);
        let factory = match sink {
            Some(sink) => PolicyChainFactory::debug(manager, sink),
            None => PolicyChainFactory::new(manager),
        };

        tracing::info!(
            policies = ?factory.manager().policy_ids(),
            request_policies = flow.request.len(),
            response_policies = flow.response.len(),
            debug = factory.is_debug(),
            "Policy engine ready"
        );

        Ok(PolicyEngine::new(Arc::new(resolver(flow)), factory))
    }
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("manager", &self.manager)
            .field("debug", &self.debug_sink.is_some())
            .finish()
    }
}

/// Initializes telemetry from `config` and builds an engine with the
/// built-in policies.
///
/// # Errors
///
/// Returns `BootstrapError` if telemetry cannot start or the flow is invalid.
pub fn init(config: TollgateConfig) -> Result<PolicyEngine, BootstrapError> {
    tollgate_telemetry::init_telemetry(&telemetry_config(&config.telemetry))?;
    EngineBuilder::new(config)?.build()
}
