//! Reference-counted lifecycle components with a dependency cascade.
//!
//! A [`Component`] pairs a [`Hooks`] implementation (the service's own
//! setup/teardown) with the bookkeeping every service needs:
//!
//! - a hold count: the first `initialize()` performs setup, later ones return
//!   immediately; only the `end()` releasing the last hold tears down
//! - an ordered dependency list, initialized depth-first and fail-fast, ended
//!   continue-on-error
//! - tracked subscriptions, released in registration order on teardown
//! - a [`Generation`] token refreshed on every full teardown
//!
//! # State Machine
//!
//! ```text
//!              initialize (holds 0→1)
//!   ┌──────┐ ─────────────────────────► ┌────────┐  initialize / end (holds > 1)
//!   │ IDLE │                            │  HELD  │ ◄──────────────────────────┐
//!   └──────┘ ◄───────────────────────── └────────┘ ───────────────────────────┘
//!              end (holds 1→0): unsubscribe, refresh generation,
//!              on_end, end dependencies
//! ```
//!
//! # Example
//!
//! ```
//! use keystone_runtime::component::{Component, Hooks};
//! use keystone_runtime::registry::Registry;
//! use keystone_core::lifecycle::{Lifecycle, LifecycleConfig};
//!
//! struct Cache;
//! impl Hooks for Cache {}
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cache = Component::new("cache", &Registry::new(), Cache);
//! let config = LifecycleConfig::default();
//!
//! assert_eq!(cache.initialize(&config).await, Ok(true));
//! assert_eq!(cache.initialize(&config).await, Ok(true)); // second hold: no-op
//! assert_eq!(cache.end(&config).await, Ok(true));
//! assert!(cache.is_initialized());
//! assert_eq!(cache.end(&config).await, Ok(true));
//! assert!(!cache.is_initialized());
//! # }
//! ```

use crate::lock;
use crate::metrics::LifecycleMetrics;
use crate::registry::Registry;
use keystone_core::lifecycle::{
    Generation, Lifecycle, LifecycleConfig, LifecycleError, LifecycleFuture, LifecycleResult,
};
use keystone_core::observable::{Observable, Subscription};
use keystone_core::registry::{RegistryError, Token};
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::any::Any;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Tracing target for lifecycle transitions (`RUST_LOG=keystone::lifecycle=debug`).
pub const LOG_TARGET: &str = "keystone::lifecycle";

/// Boxed future returned by hooks that cannot fail.
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A service's own lifecycle behavior.
///
/// Every method has a no-op default, so a value dependency with nothing to
/// set up is just `impl Hooks for MyType {}`.
pub trait Hooks: Send + Sync + 'static {
    /// Runs on the first hold, before dependencies are initialized.
    fn pre_initialize<'a>(&'a self, _scope: &'a Scope, _config: &'a LifecycleConfig) -> HookFuture<'a> {
        Box::pin(async {})
    }

    /// Own setup. Runs after every dependency initialized successfully.
    fn on_initialize<'a>(&'a self, _scope: &'a Scope, _config: &'a LifecycleConfig) -> LifecycleFuture<'a> {
        Box::pin(async { Ok(true) })
    }

    /// Runs after own setup, whatever its outcome.
    fn post_initialize<'a>(&'a self, _scope: &'a Scope, _config: &'a LifecycleConfig) -> HookFuture<'a> {
        Box::pin(async {})
    }

    /// Own teardown. Runs before dependencies are ended.
    fn on_end<'a>(&'a self, _scope: &'a Scope, _config: &'a LifecycleConfig) -> LifecycleFuture<'a> {
        Box::pin(async { Ok(true) })
    }
}

impl Hooks for () {}

struct Dependency {
    token: &'static str,
    component: Arc<dyn Lifecycle>,
    /// Whether this owner currently holds the dependency (its `initialize`
    /// was called by this owner and not yet matched by `end`).
    held: bool,
}

/// The part of a component that hooks can use: identity, dependency
/// declaration, and tracked subscriptions.
pub struct Scope {
    name: String,
    id: String,
    registry: Registry,
    dependencies: Mutex<Vec<Dependency>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Scope {
    fn new(name: String, registry: Registry) -> Self {
        let id = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(7)
            .map(char::from)
            .collect();
        Self {
            name,
            id,
            registry,
            dependencies: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Component name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Short random identifier assigned at construction.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The registry dependencies are resolved from.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Resolve `token` and, if it is a lifecycle component, add it to the
    /// cascade. Plain values are returned without being tracked.
    ///
    /// Adding a token twice keeps a single entry.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] if the token cannot be resolved to a `T`.
    pub fn add_dependency<T>(&self, token: &Token<T>) -> Result<Arc<T>, RegistryError>
    where
        T: Any + Send + Sync,
    {
        let entry = self.registry.entry(token)?;
        let value = self.registry.resolve(token)?;

        let Some(component) = entry.lifecycle().cloned() else {
            tracing::debug!(
                target: LOG_TARGET,
                component = %self.name,
                dependency = token.name(),
                "Not adding dependency: not a lifecycle component"
            );
            return Ok(value);
        };

        let mut dependencies = lock(&self.dependencies);
        if dependencies.iter().any(|dep| dep.token == token.name()) {
            tracing::debug!(
                target: LOG_TARGET,
                component = %self.name,
                dependency = token.name(),
                "Dependency already declared"
            );
            return Ok(value);
        }
        dependencies.push(Dependency {
            token: token.name(),
            component,
            held: false,
        });

        tracing::debug!(
            target: LOG_TARGET,
            component = %self.name,
            dependency = token.name(),
            dependencies = ?dependencies.iter().map(|dep| dep.token).collect::<Vec<_>>(),
            "Adding dependency"
        );
        Ok(value)
    }

    /// Subscribe to `observable`; the subscription is released automatically
    /// when the last hold is released.
    pub fn on_change<T, O, F>(&self, observable: &O, handler: F)
    where
        O: Observable<T> + ?Sized,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let subscription = observable.on_change(Arc::new(handler));
        lock(&self.subscriptions).push(subscription);
    }

    /// Track an existing subscription for automatic release.
    pub fn track(&self, subscription: Subscription) {
        lock(&self.subscriptions).push(subscription);
    }

    /// Tokens of declared lifecycle dependencies, in declaration order.
    #[must_use]
    pub fn dependency_names(&self) -> Vec<&'static str> {
        lock(&self.dependencies).iter().map(|dep| dep.token).collect()
    }

    /// Number of tracked subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    fn set_held(&self, token: &'static str, held: bool) {
        if let Some(dep) = lock(&self.dependencies).iter_mut().find(|dep| dep.token == token) {
            dep.held = held;
        }
    }

    fn snapshot(&self) -> Vec<(&'static str, Arc<dyn Lifecycle>)> {
        lock(&self.dependencies)
            .iter()
            .map(|dep| (dep.token, Arc::clone(&dep.component)))
            .collect()
    }

    /// Take every held dependency, marking it released.
    fn release_held(&self) -> Vec<(&'static str, Arc<dyn Lifecycle>)> {
        lock(&self.dependencies)
            .iter_mut()
            .filter(|dep| dep.held)
            .map(|dep| {
                dep.held = false;
                (dep.token, Arc::clone(&dep.component))
            })
            .collect()
    }

    fn unsubscribe_all(&self) {
        let subscriptions = std::mem::take(&mut *lock(&self.subscriptions));
        let count = subscriptions.len();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        if count > 0 {
            tracing::debug!(target: LOG_TARGET, component = %self.name, count, "Released subscriptions");
        }
    }
}

struct HoldState {
    hold_count: usize,
    generation: Generation,
}

/// A service wrapped with reference-counted lifecycle management.
///
/// Dereferences to its hooks so service methods stay directly callable.
pub struct Component<H: Hooks> {
    scope: Scope,
    hooks: H,
    state: Mutex<HoldState>,
    initialized: watch::Sender<bool>,
}

impl<H: Hooks> Component<H> {
    /// Wrap `hooks` with no declared dependencies.
    #[must_use]
    pub fn new(name: impl Into<String>, registry: &Registry, hooks: H) -> Self {
        Self::from_scope(Scope::new(name.into(), registry.clone()), hooks)
    }

    /// Build the hooks with access to the scope, typically to declare
    /// dependencies and keep the resolved instances.
    ///
    /// ```
    /// use keystone_runtime::component::{Component, Hooks};
    /// use keystone_runtime::registry::Registry;
    /// use keystone_core::registry::{RegistryError, Token};
    /// use std::sync::Arc;
    ///
    /// struct Auth;
    /// impl Hooks for Auth {}
    /// const AUTH: Token<Component<Auth>> = Token::new("auth");
    ///
    /// struct Profile { auth: Arc<Component<Auth>> }
    /// impl Hooks for Profile {}
    ///
    /// let registry = Registry::new();
    /// registry.register_component(&AUTH, Arc::new(Component::new("auth", &registry, Auth)));
    ///
    /// let profile = Component::build("profile", &registry, |scope| {
    ///     Ok::<_, RegistryError>(Profile { auth: scope.add_dependency(&AUTH)? })
    /// })
    /// .unwrap();
    /// assert_eq!(profile.dependency_names(), vec!["auth"]);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns whatever error `build` returns.
    pub fn build<E, F>(name: impl Into<String>, registry: &Registry, build: F) -> Result<Self, E>
    where
        F: FnOnce(&Scope) -> Result<H, E>,
    {
        let scope = Scope::new(name.into(), registry.clone());
        let hooks = build(&scope)?;
        Ok(Self::from_scope(scope, hooks))
    }

    fn from_scope(scope: Scope, hooks: H) -> Self {
        let (initialized, _) = watch::channel(false);
        Self {
            scope,
            hooks,
            state: Mutex::new(HoldState {
                hold_count: 0,
                generation: Generation::from_raw(rand::random()),
            }),
            initialized,
        }
    }

    /// The service's hooks.
    #[must_use]
    pub const fn hooks(&self) -> &H {
        &self.hooks
    }

    /// The component's scope.
    #[must_use]
    pub const fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Short random identifier assigned at construction.
    #[must_use]
    pub fn id(&self) -> &str {
        self.scope.id()
    }

    /// Current activation token.
    #[must_use]
    pub fn generation(&self) -> Generation {
        lock(&self.state).generation
    }

    /// Observe `is_initialized` transitions.
    #[must_use]
    pub fn watch_initialized(&self) -> watch::Receiver<bool> {
        self.initialized.subscribe()
    }

    /// Tokens of declared lifecycle dependencies, in declaration order.
    #[must_use]
    pub fn dependency_names(&self) -> Vec<&'static str> {
        self.scope.dependency_names()
    }

    /// See [`Scope::add_dependency`].
    ///
    /// A dependency added while this component is held joins the cascade on
    /// the next activation; use [`attach_dependency`](Self::attach_dependency)
    /// to bring it up immediately.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] if the token cannot be resolved to a `T`.
    pub fn add_dependency<T>(&self, token: &Token<T>) -> Result<Arc<T>, RegistryError>
    where
        T: Any + Send + Sync,
    {
        self.scope.add_dependency(token)
    }

    /// Add a dependency and, if this component is currently held,
    /// initialize it right away under this owner's hold.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Registry`] if the token cannot be resolved,
    /// or the dependency's initialization failure.
    pub async fn attach_dependency<T>(
        &self,
        token: &Token<T>,
        config: &LifecycleConfig,
    ) -> Result<Arc<T>, LifecycleError>
    where
        T: Any + Send + Sync,
    {
        let value = self.scope.add_dependency(token)?;
        if self.hold_count() == 0 {
            return Ok(value);
        }

        let pending = lock(&self.scope.dependencies)
            .iter()
            .find(|dep| dep.token == token.name() && !dep.held)
            .map(|dep| Arc::clone(&dep.component));

        if let Some(component) = pending {
            self.scope.set_held(token.name(), true);
            self.check_dependency(token.name(), component.initialize(config).await)?;
        }
        Ok(value)
    }

    /// End (if held by this owner) and remove one dependency outside the
    /// normal teardown cascade.
    ///
    /// Other owners' holds on the same instance are untouched. Returns
    /// `Ok(false)` if `token` was not a declared dependency.
    ///
    /// # Errors
    ///
    /// Returns the dependency's teardown failure.
    pub async fn remove_dependency<T: ?Sized>(
        &self,
        token: &Token<T>,
        config: &LifecycleConfig,
    ) -> LifecycleResult {
        let removed = {
            let mut dependencies = lock(&self.scope.dependencies);
            dependencies
                .iter()
                .position(|dep| dep.token == token.name())
                .map(|index| dependencies.remove(index))
        };

        let Some(dependency) = removed else {
            tracing::debug!(
                target: LOG_TARGET,
                component = %self.scope.name,
                dependency = token.name(),
                "Not removing dependency: not declared"
            );
            return Ok(false);
        };

        tracing::debug!(
            target: LOG_TARGET,
            component = %self.scope.name,
            dependency = dependency.token,
            held = dependency.held,
            "Removing dependency"
        );

        if dependency.held {
            dependency.component.end(config).await?;
        }
        Ok(true)
    }

    async fn initialize_component(&self, config: &LifecycleConfig) -> LifecycleResult {
        let holds = {
            let mut state = lock(&self.state);
            state.hold_count += 1;
            state.hold_count
        };

        tracing::debug!(target: LOG_TARGET, component = %self.scope.name, holds, "initialize() called");
        if holds > 1 {
            return Ok(true);
        }

        tracing::debug!(target: LOG_TARGET, component = %self.scope.name, "Initializing");
        self.hooks.pre_initialize(&self.scope, config).await;

        if let Err(error) = self.initialize_dependencies(config).await {
            tracing::error!(
                target: LOG_TARGET,
                component = %self.scope.name,
                %error,
                "Dependency initialization failed"
            );
            LifecycleMetrics::record_failure(&self.scope.name);
            self.initialized.send_replace(false);
            return Err(error);
        }

        let result = self.hooks.on_initialize(&self.scope, config).await;
        match &result {
            Ok(true) => LifecycleMetrics::record_initialized(&self.scope.name),
            Ok(false) => {
                tracing::warn!(target: LOG_TARGET, component = %self.scope.name, "Setup declined");
                LifecycleMetrics::record_failure(&self.scope.name);
            },
            Err(error) => {
                tracing::error!(target: LOG_TARGET, component = %self.scope.name, %error, "Setup failed");
                LifecycleMetrics::record_failure(&self.scope.name);
            },
        }
        self.initialized.send_replace(matches!(result, Ok(true)));

        self.hooks.post_initialize(&self.scope, config).await;
        result
    }

    async fn initialize_dependencies(&self, config: &LifecycleConfig) -> Result<(), LifecycleError> {
        let dependencies = self.scope.snapshot();
        tracing::debug!(
            target: LOG_TARGET,
            component = %self.scope.name,
            dependencies = ?dependencies.iter().map(|(token, _)| *token).collect::<Vec<_>>(),
            "Initializing dependencies"
        );

        for (token, dependency) in dependencies {
            // The dependency's hold count moves as soon as it is called, so the
            // hold is ours to release even if it fails.
            self.scope.set_held(token, true);
            self.check_dependency(token, dependency.initialize(config).await)?;
        }
        Ok(())
    }

    fn check_dependency(&self, token: &'static str, result: LifecycleResult) -> Result<(), LifecycleError> {
        match result {
            Ok(true) => Ok(()),
            Ok(false) => Err(LifecycleError::DependencyDeclined {
                component: self.scope.name.clone(),
                dependency: token.to_string(),
            }),
            Err(error) => Err(LifecycleError::DependencyFailed {
                component: self.scope.name.clone(),
                dependency: token.to_string(),
                reason: Box::new(error),
            }),
        }
    }

    async fn end_component(&self, config: &LifecycleConfig) -> LifecycleResult {
        let remaining = {
            let mut state = lock(&self.state);
            if state.hold_count == 0 {
                None
            } else {
                state.hold_count -= 1;
                if state.hold_count == 0 {
                    state.generation = Generation::from_raw(rand::random());
                }
                Some(state.hold_count)
            }
        };

        let Some(remaining) = remaining else {
            tracing::warn!(target: LOG_TARGET, component = %self.scope.name, "end() called without a hold");
            return Err(LifecycleError::NotHeld {
                component: self.scope.name.clone(),
            });
        };

        tracing::debug!(target: LOG_TARGET, component = %self.scope.name, remaining, "end() called");
        if remaining > 0 {
            return Ok(true);
        }

        tracing::debug!(target: LOG_TARGET, component = %self.scope.name, "Ending - all holds removed");
        self.scope.unsubscribe_all();

        let mut failures = Vec::new();
        match self.hooks.on_end(&self.scope, config).await {
            Ok(true) => {},
            Ok(false) => failures.push(LifecycleError::HookDeclined {
                component: self.scope.name.clone(),
                hook: "on_end",
            }),
            Err(error) => {
                tracing::error!(target: LOG_TARGET, component = %self.scope.name, %error, "Teardown hook failed");
                failures.push(error);
            },
        }

        failures.extend(self.end_dependencies(config).await);
        self.initialized.send_replace(false);
        LifecycleMetrics::record_teardown(&self.scope.name);

        if failures.is_empty() {
            Ok(true)
        } else {
            tracing::error!(
                target: LOG_TARGET,
                component = %self.scope.name,
                failures = failures.len(),
                "Teardown completed with failures"
            );
            Err(LifecycleError::TeardownFailed {
                component: self.scope.name.clone(),
                failures,
            })
        }
    }

    async fn end_dependencies(&self, config: &LifecycleConfig) -> Vec<LifecycleError> {
        let held = self.scope.release_held();
        tracing::debug!(
            target: LOG_TARGET,
            component = %self.scope.name,
            dependencies = ?held.iter().map(|(token, _)| *token).collect::<Vec<_>>(),
            "Ending dependencies"
        );

        let mut failures = Vec::new();
        for (token, dependency) in held {
            match dependency.end(config).await {
                Ok(true) => {},
                Ok(false) => failures.push(LifecycleError::DependencyDeclined {
                    component: self.scope.name.clone(),
                    dependency: token.to_string(),
                }),
                Err(error) => {
                    tracing::error!(
                        target: LOG_TARGET,
                        component = %self.scope.name,
                        dependency = token,
                        %error,
                        "Dependency failed to end"
                    );
                    failures.push(error);
                },
            }
        }
        failures
    }
}

impl<H: Hooks> Lifecycle for Component<H> {
    fn name(&self) -> &str {
        &self.scope.name
    }

    fn initialize<'a>(&'a self, config: &'a LifecycleConfig) -> LifecycleFuture<'a> {
        Box::pin(self.initialize_component(config))
    }

    fn end<'a>(&'a self, config: &'a LifecycleConfig) -> LifecycleFuture<'a> {
        Box::pin(self.end_component(config))
    }

    fn is_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    fn hold_count(&self) -> usize {
        lock(&self.state).hold_count
    }
}

impl<H: Hooks> Deref for Component<H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.hooks
    }
}

impl<H: Hooks> std::fmt::Debug for Component<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Component")
            .field("name", &self.scope.name)
            .field("id", &self.scope.id)
            .field("hold_count", &state.hold_count)
            .field("generation", &state.generation)
            .field("initialized", &*self.initialized.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::bus::ChangeBus;
    use keystone_core::change::{ChangeEvent, ChangeSource, ChangeType};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    static SEQUENCE: AtomicU64 = AtomicU64::new(0);

    #[derive(Debug, Clone, Copy, Default)]
    enum Outcome {
        #[default]
        Succeed,
        Decline,
        Fail(&'static str),
    }

    impl Outcome {
        fn result(self, component: &str) -> LifecycleResult {
            match self {
                Self::Succeed => Ok(true),
                Self::Decline => Ok(false),
                Self::Fail(reason) => Err(LifecycleError::setup(component, reason)),
            }
        }
    }

    #[derive(Default)]
    struct Probe {
        setup: Outcome,
        teardown: Outcome,
        setups: AtomicUsize,
        teardowns: AtomicUsize,
        setup_sequence: Mutex<Option<u64>>,
    }

    impl Probe {
        fn with_setup(setup: Outcome) -> Self {
            Self { setup, ..Self::default() }
        }

        fn with_teardown(teardown: Outcome) -> Self {
            Self { teardown, ..Self::default() }
        }

        fn setup_calls(&self) -> usize {
            self.setups.load(Ordering::SeqCst)
        }

        fn teardown_calls(&self) -> usize {
            self.teardowns.load(Ordering::SeqCst)
        }

        fn setup_sequence(&self) -> Option<u64> {
            *self.setup_sequence.lock().unwrap()
        }
    }

    impl Hooks for Probe {
        fn on_initialize<'a>(&'a self, scope: &'a Scope, _config: &'a LifecycleConfig) -> LifecycleFuture<'a> {
            Box::pin(async move {
                self.setups.fetch_add(1, Ordering::SeqCst);
                *self.setup_sequence.lock().unwrap() = Some(SEQUENCE.fetch_add(1, Ordering::SeqCst));
                self.setup.result(scope.name())
            })
        }

        fn on_end<'a>(&'a self, scope: &'a Scope, _config: &'a LifecycleConfig) -> LifecycleFuture<'a> {
            Box::pin(async move {
                self.teardowns.fetch_add(1, Ordering::SeqCst);
                self.teardown.result(scope.name())
            })
        }
    }

    const DEP_A: Token<Component<Probe>> = Token::new("dep-a");
    const DEP_B: Token<Component<Probe>> = Token::new("dep-b");
    const PLAIN: Token<String> = Token::new("plain");

    fn register(registry: &Registry, token: &Token<Component<Probe>>, hooks: Probe) -> Arc<Component<Probe>> {
        let component = Arc::new(Component::new(token.name(), registry, hooks));
        registry.register_component(token, Arc::clone(&component));
        component
    }

    fn owner(registry: &Registry, name: &str, deps: &[&Token<Component<Probe>>]) -> Component<Probe> {
        Component::build(name, registry, |scope| {
            for token in deps {
                scope.add_dependency(*token)?;
            }
            Ok::<_, RegistryError>(Probe::default())
        })
        .unwrap()
    }

    #[tokio::test]
    async fn repeated_holds_run_setup_and_teardown_once() {
        let registry = Registry::new();
        let component = Component::new("svc", &registry, Probe::default());
        let config = LifecycleConfig::default();

        for _ in 0..3 {
            assert_eq!(component.initialize(&config).await, Ok(true));
        }
        assert_eq!(component.hold_count(), 3);
        for _ in 0..3 {
            assert_eq!(component.end(&config).await, Ok(true));
        }

        assert_eq!(component.setup_calls(), 1);
        assert_eq!(component.teardown_calls(), 1);
        assert!(!component.is_initialized());
    }

    #[tokio::test]
    async fn dependencies_initialize_in_declaration_order() {
        let registry = Registry::new();
        let a = register(&registry, &DEP_A, Probe::default());
        let b = register(&registry, &DEP_B, Probe::default());
        let owner = owner(&registry, "owner", &[&DEP_A, &DEP_B]);

        assert_eq!(owner.initialize(&LifecycleConfig::default()).await, Ok(true));
        assert!(a.is_initialized() && b.is_initialized());
        assert!(a.setup_sequence().unwrap() < b.setup_sequence().unwrap());
        assert!(b.setup_sequence().unwrap() < owner.setup_sequence().unwrap());
    }

    #[tokio::test]
    async fn failing_dependency_stops_the_walk() {
        let registry = Registry::new();
        let a = register(&registry, &DEP_A, Probe::with_setup(Outcome::Fail("offline")));
        let b = register(&registry, &DEP_B, Probe::default());
        let owner = owner(&registry, "owner", &[&DEP_A, &DEP_B]);
        let config = LifecycleConfig::default();

        let result = owner.initialize(&config).await;
        assert!(matches!(
            result,
            Err(LifecycleError::DependencyFailed { ref dependency, .. }) if dependency == "dep-a"
        ));
        assert_eq!(owner.setup_calls(), 0);
        assert!(!owner.is_initialized());
        assert_eq!(b.hold_count(), 0, "later dependencies are never attempted");

        // The failed dependency's hold is released through the normal end path
        assert_eq!(a.hold_count(), 1);
        assert_eq!(owner.end(&config).await, Ok(true));
        assert_eq!(a.hold_count(), 0);
        assert_eq!(b.teardown_calls(), 0);
    }

    #[tokio::test]
    async fn declining_dependency_fails_fast() {
        let registry = Registry::new();
        register(&registry, &DEP_A, Probe::with_setup(Outcome::Decline));
        let owner = owner(&registry, "owner", &[&DEP_A]);

        assert!(matches!(
            owner.initialize(&LifecycleConfig::default()).await,
            Err(LifecycleError::DependencyDeclined { .. })
        ));
        assert_eq!(owner.setup_calls(), 0);
    }

    #[tokio::test]
    async fn own_setup_failure_keeps_dependencies_up_until_end() {
        let registry = Registry::new();
        let a = register(&registry, &DEP_A, Probe::default());
        let owner = Component::build("owner", &registry, |scope| {
            scope.add_dependency(&DEP_A)?;
            Ok::<_, RegistryError>(Probe::with_setup(Outcome::Fail("bad config")))
        })
        .unwrap();
        let config = LifecycleConfig::default();

        assert!(matches!(
            owner.initialize(&config).await,
            Err(LifecycleError::SetupFailed { .. })
        ));
        assert!(!owner.is_initialized());
        assert!(a.is_initialized());

        owner.end(&config).await.unwrap();
        assert!(!a.is_initialized());
    }

    #[tokio::test]
    async fn teardown_continues_past_failures_and_aggregates() {
        let registry = Registry::new();
        let a = register(&registry, &DEP_A, Probe::with_teardown(Outcome::Fail("stuck")));
        let b = register(&registry, &DEP_B, Probe::default());
        let owner = owner(&registry, "owner", &[&DEP_A, &DEP_B]);
        let config = LifecycleConfig::default();

        owner.initialize(&config).await.unwrap();
        let result = owner.end(&config).await;

        match result {
            Err(LifecycleError::TeardownFailed { component, failures }) => {
                assert_eq!(component, "owner");
                assert_eq!(failures.len(), 1);
            },
            other => unreachable!("expected teardown failure, got {other:?}"),
        }
        assert_eq!(a.teardown_calls(), 1);
        assert_eq!(b.teardown_calls(), 1, "later dependencies are still ended");
        assert!(!owner.is_initialized());
    }

    #[tokio::test]
    async fn plain_values_pass_through_without_tracking() {
        let registry = Registry::new();
        registry.register_value(&PLAIN, Arc::new("value".to_string()));
        let owner = Component::new("owner", &registry, ());

        assert_eq!(*owner.add_dependency(&PLAIN).unwrap(), "value");
        assert!(owner.dependency_names().is_empty());
    }

    #[tokio::test]
    async fn shared_dependency_keeps_independent_holds() {
        let registry = Registry::new();
        let shared = register(&registry, &DEP_A, Probe::default());
        let first = owner(&registry, "first", &[&DEP_A]);
        let second = owner(&registry, "second", &[&DEP_A]);
        let config = LifecycleConfig::default();

        first.initialize(&config).await.unwrap();
        second.initialize(&config).await.unwrap();
        assert_eq!(shared.hold_count(), 2);

        assert_eq!(first.remove_dependency(&DEP_A, &config).await, Ok(true));
        assert_eq!(shared.hold_count(), 1);
        assert!(shared.is_initialized());

        // Removing again is a no-op and never reaches into the other owner's hold
        assert_eq!(first.remove_dependency(&DEP_A, &config).await, Ok(false));
        first.end(&config).await.unwrap();
        assert_eq!(shared.hold_count(), 1);

        second.end(&config).await.unwrap();
        assert_eq!(shared.hold_count(), 0);
        assert_eq!(shared.teardown_calls(), 1);
    }

    #[tokio::test]
    async fn removing_an_unheld_dependency_does_not_end_it() {
        let registry = Registry::new();
        let shared = register(&registry, &DEP_A, Probe::default());
        let idle_owner = owner(&registry, "idle", &[&DEP_A]);
        let config = LifecycleConfig::default();

        shared.initialize(&config).await.unwrap();
        assert_eq!(idle_owner.remove_dependency(&DEP_A, &config).await, Ok(true));
        assert_eq!(shared.hold_count(), 1);
    }

    #[tokio::test]
    async fn attach_dependency_initializes_when_live() {
        let registry = Registry::new();
        let late = register(&registry, &DEP_B, Probe::default());
        let owner = owner(&registry, "owner", &[]);
        let config = LifecycleConfig::default();

        owner.initialize(&config).await.unwrap();
        owner.attach_dependency(&DEP_B, &config).await.unwrap();
        assert!(late.is_initialized());

        owner.end(&config).await.unwrap();
        assert!(!late.is_initialized());
    }

    #[tokio::test]
    async fn subscriptions_are_released_on_teardown() {
        let registry = Registry::new();
        let bus = ChangeBus::new(Duration::ZERO);
        let component = Component::new("listener", &registry, ());
        let config = LifecycleConfig::default();

        component.initialize(&config).await.unwrap();
        component.scope().on_change(&bus, |_event: &Arc<ChangeEvent>| {});
        component.scope().on_change(&bus, |_event: &Arc<ChangeEvent>| {});
        assert_eq!(bus.subscriber_count(), 2);

        component.end(&config).await.unwrap();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(component.scope().subscription_count(), 0);

        bus.emit_change(ChangeType::Chat, serde_json::Value::Null, ChangeSource::System);
    }

    #[tokio::test]
    async fn tracked_subscriptions_release_once_in_registration_order() {
        let registry = Registry::new();
        let component = Component::new("listener", &registry, ());
        let config = LifecycleConfig::default();
        let released = Arc::new(Mutex::new(Vec::new()));

        component.initialize(&config).await.unwrap();
        for label in ["first", "second"] {
            let released = Arc::clone(&released);
            component
                .scope()
                .track(Subscription::new(move || released.lock().unwrap().push(label)));
        }
        assert!(released.lock().unwrap().is_empty());

        component.end(&config).await.unwrap();
        assert_eq!(*released.lock().unwrap(), vec!["first", "second"]);

        // A later activation has nothing left to release
        component.initialize(&config).await.unwrap();
        component.end(&config).await.unwrap();
        assert_eq!(released.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn generation_changes_only_on_full_teardown() {
        let registry = Registry::new();
        let component = Component::new("svc", &registry, ());
        let config = LifecycleConfig::default();
        let initial = component.generation();

        component.initialize(&config).await.unwrap();
        component.initialize(&config).await.unwrap();
        component.end(&config).await.unwrap();
        assert_eq!(component.generation(), initial);

        component.end(&config).await.unwrap();
        assert_ne!(component.generation(), initial);
    }

    #[tokio::test]
    async fn unmatched_end_is_reported() {
        let registry = Registry::new();
        let component = Component::new("svc", &registry, ());
        assert_eq!(
            component.end(&LifecycleConfig::default()).await,
            Err(LifecycleError::NotHeld {
                component: "svc".to_string()
            })
        );
    }

    #[tokio::test]
    async fn initialized_flag_is_observable() {
        let registry = Registry::new();
        let component = Component::new("svc", &registry, ());
        let mut rx = component.watch_initialized();
        let config = LifecycleConfig::default();

        component.initialize(&config).await.unwrap();
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        component.end(&config).await.unwrap();
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
    }
}
