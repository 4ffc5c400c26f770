//! Property tests for chain ordering, filtering and failure handling.

use parking_lot::Mutex;
use proptest::prelude::*;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tollgate_core::{BoxFuture, ExecutionContext, PolicyError};
use tollgate_policy::prelude::*;
use tollgate_policy::{ChainState, FailureKind};

static NEXT_RUN: AtomicUsize = AtomicUsize::new(0);
static RUNS: OnceLock<Mutex<HashMap<usize, Vec<usize>>>> = OnceLock::new();

fn runs() -> &'static Mutex<HashMap<usize, Vec<usize>>> {
    RUNS.get_or_init(|| Mutex::new(HashMap::new()))
}

#[derive(Deserialize)]
struct StepConfig {
    run: usize,
    index: usize,
    fail: bool,
}

/// Appends its index to the invocation list of its run.
struct Step {
    run: usize,
    index: usize,
    fail: bool,
}

impl Step {
    fn on_request<'a>(&'a self, _ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
        Box::pin(async move {
            runs().lock().entry(self.run).or_default().push(self.index);
            if self.fail {
                Err(PolicyError::msg(format!("step {} failed", self.index)))
            } else {
                Ok(PolicyOutcome::Continue)
            }
        })
    }
}

impl Policy for Step {
    const ID: &'static str = "step";
    const SCOPE: PolicyScope = PolicyScope::PerRequest;
    type Config = StepConfig;

    fn from_config(config: StepConfig) -> Result<Self, PolicyError> {
        Ok(Self {
            run: config.run,
            index: config.index,
            fail: config.fail,
        })
    }

    fn register(hooks: &mut HookRegistrar<Self>) {
        hooks.on_request(Self::on_request);
    }
}

struct Silent;

impl Policy for Silent {
    const ID: &'static str = "silent";
    type Config = serde_json::Value;

    fn from_config(_config: serde_json::Value) -> Result<Self, PolicyError> {
        Ok(Silent)
    }

    fn register(_hooks: &mut HookRegistrar<Self>) {}
}

/// One generated chain entry.
#[derive(Debug, Clone)]
struct Entry {
    hooked: bool,
    included: bool,
    fail: bool,
}

fn entry() -> impl Strategy<Value = Entry> {
    (any::<bool>(), prop::bool::weighted(0.8), prop::bool::weighted(0.15)).prop_map(|(hooked, included, fail)| Entry {
        hooked,
        included,
        fail,
    })
}

fn factory() -> PolicyChainFactory {
    let mut manager = PolicyManager::new();
    manager.register::<Step>().unwrap().register::<Silent>().unwrap();
    PolicyChainFactory::new(Arc::new(manager))
}

struct Outcome {
    invoked: Vec<usize>,
    result: Result<(), tollgate_policy::ChainFailure>,
    state: ChainState,
    len: usize,
}

fn run_chain(entries: &[Entry]) -> Outcome {
    let run = NEXT_RUN.fetch_add(1, Ordering::SeqCst);
    let resolved: Vec<ResolvedPolicy> = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let policy = if entry.hooked {
                ResolvedPolicy::new("step").with_configuration(json!({
                    "run": run,
                    "index": index,
                    "fail": entry.fail,
                }))
            } else {
                ResolvedPolicy::new("silent")
            };
            policy.with_condition(if entry.included { "true" } else { "{false}" })
        })
        .collect();

    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
    runtime.block_on(async {
        let mut ctx = ExecutionContext::new(http::Request::new(()));
        let mut chain = factory().create_chain(&resolved, StreamType::OnRequest, &ctx).unwrap();
        let len = chain.len();
        let result = chain.execute(&mut ctx).await;
        Outcome {
            invoked: runs().lock().remove(&run).unwrap_or_default(),
            result,
            state: chain.state(),
            len,
        }
    })
}

proptest! {
    #[test]
    fn prop_hooks_run_once_in_order_until_first_failure(entries in prop::collection::vec(entry(), 0..12)) {
        let outcome = run_chain(&entries);

        let runnable: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.included && e.hooked)
            .map(|(i, _)| i)
            .collect();
        let first_failure = runnable.iter().position(|&i| entries[i].fail);
        let expected = match first_failure {
            Some(at) => runnable[..=at].to_vec(),
            None => runnable.clone(),
        };

        prop_assert_eq!(&outcome.invoked, &expected);
        match first_failure {
            Some(at) => {
                let failure = outcome.result.as_ref().unwrap_err();
                prop_assert_eq!(
                    &failure.kind,
                    &FailureKind::Error(format!("step {} failed", runnable[at]))
                );
                prop_assert_eq!(outcome.state, ChainState::Failed);
            }
            None => {
                prop_assert!(outcome.result.is_ok());
                prop_assert_eq!(outcome.state, ChainState::Done);
            }
        }
    }

    #[test]
    fn prop_excluded_policies_contribute_no_entries(entries in prop::collection::vec(entry(), 0..12)) {
        let outcome = run_chain(&entries);
        let included = entries.iter().filter(|e| e.included).count();

        prop_assert_eq!(outcome.len, included);
        for index in &outcome.invoked {
            prop_assert!(entries[*index].included);
        }
    }
}
