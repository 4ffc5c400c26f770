//! Policy hook registration and metadata resolution.
//!
//! A policy type declares its hooks once, through [`Policy::register`].
//! [`PolicyMethodResolver`] runs that registration, validates it and turns
//! it into an immutable [`PolicyMetadata`]; [`MetadataCache`] memoizes the
//! result per type for the lifetime of the process. Nothing on the request
//! path looks a hook up by name.
//!
//! # Example
//!
//! ```
//! use tollgate_core::{BoxFuture, ExecutionContext, PolicyError};
//! use tollgate_policy::metadata::{HookRegistrar, HookResult, Policy, PolicyOutcome};
//! use tollgate_policy::{HookKind, MetadataCache};
//!
//! struct Audit;
//!
//! impl Audit {
//!     fn on_request<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
//!         Box::pin(async move {
//!             ctx.set_attribute("audited", true);
//!             Ok(PolicyOutcome::Continue)
//!         })
//!     }
//! }
//!
//! impl Policy for Audit {
//!     const ID: &'static str = "audit";
//!     type Config = serde_json::Value;
//!
//!     fn from_config(_config: Self::Config) -> Result<Self, PolicyError> {
//!         Ok(Audit)
//!     }
//!
//!     fn register(hooks: &mut HookRegistrar<Self>) {
//!         hooks.on_request(Self::on_request);
//!     }
//! }
//!
//! let metadata = MetadataCache::global().resolve::<Audit>().unwrap();
//! assert!(metadata.has_hook(HookKind::OnRequest));
//! assert!(!metadata.has_hook(HookKind::OnResponse));
//! ```

use crate::content::ContentStream;
use crate::error::ResolutionError;
use crate::hook::HookKind;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};
use tollgate_core::{BoxFuture, ExecutionContext, PolicyError, PolicyResult};

/// What a lifecycle hook decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOutcome {
    /// Hand control to the next policy.
    Continue,
    /// Stop the chain and answer with this result.
    Interrupt(PolicyResult),
}

/// Return type of lifecycle hooks.
pub type HookResult = Result<PolicyOutcome, PolicyError>;

/// Return type of content hooks: a stream for this exchange, or `None` to
/// let the body through untouched.
pub type ContentResult = Result<Option<Box<dyn ContentStream>>, PolicyError>;

/// A lifecycle hook of policy type `P`.
pub type LifecycleFn<P> = Arc<
    dyn for<'a> Fn(&'a P, &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> + Send + Sync,
>;

/// A content hook of policy type `P`.
pub type ContentFn<P> = Arc<dyn Fn(&P, &mut ExecutionContext) -> ContentResult + Send + Sync>;

/// Whether instances may be shared between exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyScope {
    /// One instance per distinct configuration, reused by every exchange.
    #[default]
    Shared,
    /// A fresh instance for every chain.
    PerRequest,
}

/// A policy implementation.
///
/// Implementors build themselves from a typed configuration and declare
/// their hooks in [`register`](Policy::register). Hooks are usually
/// methods with the shape
/// `fn(&'a self, &'a mut ExecutionContext) -> BoxFuture<'a, HookResult>`.
pub trait Policy: Send + Sync + Sized + 'static {
    /// Plugin id the policy is registered under by default.
    const ID: &'static str;

    /// Instance sharing strategy.
    const SCOPE: PolicyScope = PolicyScope::Shared;

    /// Configuration payload, deserialized from the resolved policy.
    type Config: DeserializeOwned;

    /// Builds an instance from its configuration.
    fn from_config(config: Self::Config) -> Result<Self, PolicyError>;

    /// Declares the hooks this policy implements.
    fn register(hooks: &mut HookRegistrar<Self>);
}

/// A registered hook handle.
pub enum Hook<P> {
    /// Runs on a request or response head.
    Lifecycle(LifecycleFn<P>),
    /// Produces a content stream for a request or response body.
    Content(ContentFn<P>),
}

impl<P> Hook<P> {
    /// Wraps a lifecycle function.
    pub fn lifecycle<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a P, &'a mut ExecutionContext) -> BoxFuture<'a, HookResult>
            + Send
            + Sync
            + 'static,
    {
        Self::Lifecycle(Arc::new(f))
    }

    /// Wraps a content function.
    pub fn content<F>(f: F) -> Self
    where
        F: Fn(&P, &mut ExecutionContext) -> ContentResult + Send + Sync + 'static,
    {
        Self::Content(Arc::new(f))
    }

    const fn shape(&self) -> &'static str {
        match self {
            Self::Lifecycle(_) => "lifecycle",
            Self::Content(_) => "content",
        }
    }
}

impl<P> Clone for Hook<P> {
    fn clone(&self) -> Self {
        match self {
            Self::Lifecycle(f) => Self::Lifecycle(Arc::clone(f)),
            Self::Content(f) => Self::Content(Arc::clone(f)),
        }
    }
}

impl<P> std::fmt::Debug for Hook<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hook::{}(<fn>)", self.shape())
    }
}

/// Collects the hooks of one policy type.
pub struct HookRegistrar<P> {
    hooks: Vec<(HookKind, Hook<P>)>,
    /// Hooks lifted from components, shadowed by `hooks` of the same kind.
    inherited: Vec<(HookKind, Hook<P>)>,
}

impl<P: 'static> HookRegistrar<P> {
    fn new() -> Self {
        Self {
            hooks: Vec::new(),
            inherited: Vec::new(),
        }
    }

    /// Returns every hook in resolution order, inherited hooks of a kind the
    /// type registers itself left out.
    fn into_hooks(self) -> impl Iterator<Item = (HookKind, Hook<P>)> {
        let own: BTreeSet<HookKind> = self.hooks.iter().map(|(kind, _)| *kind).collect();
        let inherited = self.inherited.into_iter().filter(move |(kind, _)| !own.contains(kind));
        self.hooks.into_iter().chain(inherited)
    }

    /// Registers a hook handle for a kind.
    ///
    /// Shape and uniqueness are checked when the registration is resolved.
    pub fn hook(&mut self, kind: HookKind, hook: Hook<P>) -> &mut Self {
        self.hooks.push((kind, hook));
        self
    }

    /// Registers the request head hook.
    pub fn on_request<F>(&mut self, f: F) -> &mut Self
    where
        F: for<'a> Fn(&'a P, &'a mut ExecutionContext) -> BoxFuture<'a, HookResult>
            + Send
            + Sync
            + 'static,
    {
        self.hook(HookKind::OnRequest, Hook::lifecycle(f))
    }

    /// Registers the response head hook.
    pub fn on_response<F>(&mut self, f: F) -> &mut Self
    where
        F: for<'a> Fn(&'a P, &'a mut ExecutionContext) -> BoxFuture<'a, HookResult>
            + Send
            + Sync
            + 'static,
    {
        self.hook(HookKind::OnResponse, Hook::lifecycle(f))
    }

    /// Registers the request body hook.
    pub fn on_request_content<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&P, &mut ExecutionContext) -> ContentResult + Send + Sync + 'static,
    {
        self.hook(HookKind::OnRequestContent, Hook::content(f))
    }

    /// Registers the response body hook.
    pub fn on_response_content<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&P, &mut ExecutionContext) -> ContentResult + Send + Sync + 'static,
    {
        self.hook(HookKind::OnResponseContent, Hook::content(f))
    }

    /// Exposes every hook of a component policy `C` that `P` embeds.
    ///
    /// `project` borrows the component out of the outer policy; each of
    /// `C`'s hooks is re-registered on `P` through it. A hook `P` registers
    /// itself replaces the inherited hook of the same kind, whichever is
    /// declared first. Two components providing the same kind is still a
    /// duplicate.
    pub fn inherit<C: Policy>(&mut self, project: fn(&P) -> &C) -> &mut Self {
        let mut component = HookRegistrar::<C>::new();
        C::register(&mut component);

        for (kind, hook) in component.into_hooks() {
            let lifted = match hook {
                Hook::Lifecycle(inner) => lift_lifecycle(project, inner),
                Hook::Content(inner) => Hook::content(move |policy, ctx| (*inner)(project(policy), ctx)),
            };
            self.inherited.push((kind, lifted));
        }
        self
    }
}

fn lift_lifecycle<P: 'static, C: 'static>(project: fn(&P) -> &C, inner: LifecycleFn<C>) -> Hook<P> {
    Hook::lifecycle(move |policy, ctx| (*inner)(project(policy), ctx))
}

/// Resolved hooks of one policy type.
///
/// Immutable after construction and shared read-only by every chain that
/// runs the type. A kind is present iff the type registered it.
pub struct PolicyMetadata<P> {
    id: &'static str,
    type_name: &'static str,
    hooks: BTreeMap<HookKind, Hook<P>>,
}

impl<P: Policy> PolicyMetadata<P> {
    /// Returns the policy id.
    #[must_use]
    pub fn id(&self) -> &'static str {
        self.id
    }

    /// Returns the Rust type name of the policy.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns the type identity.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        TypeId::of::<P>()
    }

    /// Returns true if the kind was registered.
    #[must_use]
    pub fn has_hook(&self, kind: HookKind) -> bool {
        self.hooks.contains_key(&kind)
    }

    /// Returns the registered kinds.
    #[must_use]
    pub fn hook_kinds(&self) -> BTreeSet<HookKind> {
        self.hooks.keys().copied().collect()
    }

    /// Returns the handle of a kind.
    #[must_use]
    pub fn hook(&self, kind: HookKind) -> Option<&Hook<P>> {
        self.hooks.get(&kind)
    }

    /// Returns the lifecycle handle of a kind.
    #[must_use]
    pub fn lifecycle(&self, kind: HookKind) -> Option<LifecycleFn<P>> {
        match self.hooks.get(&kind) {
            Some(Hook::Lifecycle(f)) => Some(Arc::clone(f)),
            _ => None,
        }
    }

    /// Returns the content handle of a kind.
    #[must_use]
    pub fn content(&self, kind: HookKind) -> Option<ContentFn<P>> {
        match self.hooks.get(&kind) {
            Some(Hook::Content(f)) => Some(Arc::clone(f)),
            _ => None,
        }
    }
}

impl<P> std::fmt::Debug for PolicyMetadata<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyMetadata")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Turns a policy's registration into validated metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct PolicyMethodResolver;

impl PolicyMethodResolver {
    /// Runs `P::register` and validates the result.
    ///
    /// # Errors
    ///
    /// - [`ResolutionError::IncompatibleHook`] when a lifecycle kind gets a
    ///   content handle or the other way around
    /// - [`ResolutionError::DuplicateHook`] when a kind is registered twice
    pub fn resolve<P: Policy>(&self) -> Result<PolicyMetadata<P>, ResolutionError> {
        let type_name = std::any::type_name::<P>();
        let mut registrar = HookRegistrar::<P>::new();
        P::register(&mut registrar);

        let mut hooks = BTreeMap::new();
        for (kind, hook) in registrar.into_hooks() {
            let expected = if kind.is_content() { "content" } else { "lifecycle" };
            if hook.shape() != expected {
                return Err(ResolutionError::IncompatibleHook {
                    policy: type_name,
                    hook: kind,
                    expected,
                });
            }
            if hooks.insert(kind, hook).is_some() {
                return Err(ResolutionError::DuplicateHook {
                    policy: type_name,
                    hook: kind,
                });
            }
        }

        Ok(PolicyMetadata {
            id: P::ID,
            type_name,
            hooks,
        })
    }
}

/// Process-wide memo of resolved metadata, keyed by policy type.
///
/// Safe under concurrent first-time population: racing resolvers may both
/// compute, the first insert wins and every caller gets the same `Arc`.
#[derive(Default)]
pub struct MetadataCache {
    resolver: PolicyMethodResolver,
    entries: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl MetadataCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide cache.
    pub fn global() -> &'static MetadataCache {
        static GLOBAL: OnceLock<MetadataCache> = OnceLock::new();
        GLOBAL.get_or_init(MetadataCache::new)
    }

    /// Returns the metadata of `P`, resolving it on first use.
    ///
    /// Failed resolutions are not cached.
    pub fn resolve<P: Policy>(&self) -> Result<Arc<PolicyMetadata<P>>, ResolutionError> {
        let key = TypeId::of::<P>();

        if let Some(entry) = self.entries.read().get(&key) {
            return Ok(downcast_metadata::<P>(Arc::clone(entry)));
        }

        let resolved: Arc<dyn Any + Send + Sync> = Arc::new(self.resolver.resolve::<P>()?);
        let entry = Arc::clone(self.entries.write().entry(key).or_insert(resolved));
        Ok(downcast_metadata::<P>(entry))
    }

    /// Returns the number of cached policy types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing was resolved yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("entries", &self.len())
            .finish()
    }
}

fn downcast_metadata<P: Policy>(entry: Arc<dyn Any + Send + Sync>) -> Arc<PolicyMetadata<P>> {
    match entry.downcast::<PolicyMetadata<P>>() {
        Ok(metadata) => metadata,
        // Entries are keyed by the TypeId of their own policy type
        Err(_) => unreachable!("metadata cache entry does not match its type id"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::StreamSignal;
    use bytes::Bytes;

    struct Passthrough;

    impl ContentStream for Passthrough {
        fn on_chunk(&mut self, _ctx: &mut ExecutionContext, chunk: Bytes) -> Result<StreamSignal, PolicyError> {
            Ok(StreamSignal::Continue(vec![chunk]))
        }
    }

    struct Full;

    impl Full {
        fn on_request<'a>(&'a self, _ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
            Box::pin(async { Ok(PolicyOutcome::Continue) })
        }

        fn on_response<'a>(&'a self, _ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
            Box::pin(async { Ok(PolicyOutcome::Continue) })
        }

        fn on_content(&self, _ctx: &mut ExecutionContext) -> ContentResult {
            Ok(Some(Box::new(Passthrough)))
        }
    }

    impl Policy for Full {
        const ID: &'static str = "full";
        type Config = ();

        fn from_config(_config: ()) -> Result<Self, PolicyError> {
            Ok(Full)
        }

        fn register(hooks: &mut HookRegistrar<Self>) {
            hooks
                .on_request(Self::on_request)
                .on_response(Self::on_response)
                .on_request_content(Self::on_content)
                .on_response_content(Self::on_content);
        }
    }

    struct Empty;

    impl Policy for Empty {
        const ID: &'static str = "empty";
        type Config = ();

        fn from_config(_config: ()) -> Result<Self, PolicyError> {
            Ok(Empty)
        }

        fn register(_hooks: &mut HookRegistrar<Self>) {}
    }

    struct Mismatched;

    impl Mismatched {
        fn on_request<'a>(&'a self, _ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
            Box::pin(async { Ok(PolicyOutcome::Continue) })
        }
    }

    impl Policy for Mismatched {
        const ID: &'static str = "mismatched";
        type Config = ();

        fn from_config(_config: ()) -> Result<Self, PolicyError> {
            Ok(Mismatched)
        }

        fn register(hooks: &mut HookRegistrar<Self>) {
            hooks.hook(HookKind::OnRequestContent, Hook::lifecycle(Self::on_request));
        }
    }

    struct Twice;

    impl Twice {
        fn on_request<'a>(&'a self, _ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
            Box::pin(async { Ok(PolicyOutcome::Continue) })
        }
    }

    impl Policy for Twice {
        const ID: &'static str = "twice";
        type Config = ();

        fn from_config(_config: ()) -> Result<Self, PolicyError> {
            Ok(Twice)
        }

        fn register(hooks: &mut HookRegistrar<Self>) {
            hooks.on_request(Self::on_request).on_request(Self::on_request);
        }
    }

    struct Wrapper {
        inner: Full,
    }

    impl Wrapper {
        const fn inner(&self) -> &Full {
            &self.inner
        }
    }

    impl Policy for Wrapper {
        const ID: &'static str = "wrapper";
        type Config = ();

        fn from_config(_config: ()) -> Result<Self, PolicyError> {
            Ok(Wrapper { inner: Full })
        }

        fn register(hooks: &mut HookRegistrar<Self>) {
            hooks.inherit(Self::inner);
        }
    }

    #[test]
    fn test_resolve_all_hooks() {
        let metadata = PolicyMethodResolver.resolve::<Full>().unwrap();
        assert_eq!(metadata.id(), "full");
        assert_eq!(metadata.hook_kinds().len(), 4);
        assert!(metadata.lifecycle(HookKind::OnRequest).is_some());
        assert!(metadata.content(HookKind::OnResponseContent).is_some());
        // Shape-checked accessors never cross kinds
        assert!(metadata.content(HookKind::OnRequest).is_none());
        assert!(metadata.lifecycle(HookKind::OnRequestContent).is_none());
    }

    #[test]
    fn test_resolve_no_hooks() {
        let metadata = PolicyMethodResolver.resolve::<Empty>().unwrap();
        assert!(metadata.hook_kinds().is_empty());
        for kind in HookKind::ALL {
            assert!(!metadata.has_hook(kind));
        }
    }

    #[test]
    fn test_incompatible_hook_fails_fast() {
        let err = PolicyMethodResolver.resolve::<Mismatched>().unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::IncompatibleHook {
                hook: HookKind::OnRequestContent,
                expected: "content",
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_hook_fails_fast() {
        let err = PolicyMethodResolver.resolve::<Twice>().unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::DuplicateHook {
                hook: HookKind::OnRequest,
                ..
            }
        ));
    }

    /// Inherits `Full`, replacing its request hook.
    struct Overriding {
        inner: Full,
    }

    impl Overriding {
        const fn inner(&self) -> &Full {
            &self.inner
        }

        fn on_request<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, HookResult> {
            Box::pin(async move {
                ctx.set_attribute("overridden", true);
                Ok(PolicyOutcome::Continue)
            })
        }
    }

    impl Policy for Overriding {
        const ID: &'static str = "overriding";
        type Config = ();

        fn from_config(_config: ()) -> Result<Self, PolicyError> {
            Ok(Overriding { inner: Full })
        }

        fn register(hooks: &mut HookRegistrar<Self>) {
            hooks.inherit(Self::inner).on_request(Self::on_request);
        }
    }

    /// Inherits `Full` twice.
    struct Doubled {
        inner: Full,
    }

    impl Doubled {
        const fn inner(&self) -> &Full {
            &self.inner
        }
    }

    impl Policy for Doubled {
        const ID: &'static str = "doubled";
        type Config = ();

        fn from_config(_config: ()) -> Result<Self, PolicyError> {
            Ok(Doubled { inner: Full })
        }

        fn register(hooks: &mut HookRegistrar<Self>) {
            hooks.inherit(Self::inner).inherit(Self::inner);
        }
    }

    #[tokio::test]
    async fn test_own_hook_shadows_inherited() {
        let metadata = PolicyMethodResolver.resolve::<Overriding>().unwrap();
        assert_eq!(metadata.hook_kinds().len(), 4);

        let policy = Overriding { inner: Full };
        let mut ctx = ExecutionContext::new(http::Request::new(()));
        let on_request = metadata.lifecycle(HookKind::OnRequest).unwrap();
        (*on_request)(&policy, &mut ctx).await.unwrap();
        assert_eq!(ctx.attribute("overridden"), Some(&serde_json::json!(true)));
    }

    #[test]
    fn test_same_kind_from_two_components_is_duplicate() {
        let err = PolicyMethodResolver.resolve::<Doubled>().unwrap_err();
        assert!(matches!(err, ResolutionError::DuplicateHook { .. }));
    }

    #[test]
    fn test_inherited_hooks() {
        let metadata = PolicyMethodResolver.resolve::<Wrapper>().unwrap();
        assert_eq!(metadata.id(), "wrapper");
        assert_eq!(
            metadata.hook_kinds(),
            PolicyMethodResolver.resolve::<Full>().unwrap().hook_kinds()
        );
    }

    #[test]
    fn test_cache_is_idempotent() {
        let cache = MetadataCache::new();
        let first = cache.resolve::<Full>().unwrap();
        let second = cache.resolve::<Full>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.hook_kinds(), second.hook_kinds());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_does_not_store_failures() {
        let cache = MetadataCache::new();
        assert!(cache.resolve::<Twice>().is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_concurrent_first_population() {
        let cache = Arc::new(MetadataCache::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.resolve::<Full>().unwrap())
            })
            .collect();

        let resolved: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for metadata in &resolved[1..] {
            assert!(Arc::ptr_eq(&resolved[0], metadata));
        }
        assert_eq!(cache.len(), 1);
    }
}
