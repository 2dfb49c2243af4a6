//! The action dispatcher: change events in, queued actions out.
//!
//! [`Dispatcher`] subscribes to the [`ChangeBus`] while it is held. For every
//! event whose type passes the gate, each action registered for that type is
//! submitted to a bounded [`ActionQueue`] in registration order, and the
//! type's outstanding-work counter is raised by the number of actions. The
//! counter drops as actions settle (success, failure or panic alike);
//! [`wait_for_change_actions`](Dispatcher::wait_for_change_actions) resolves
//! when it reaches zero.
//!
//! # Per-Type State
//!
//! ```text
//!             emit (enabled, ≥1 action)
//!   ┌──────┐ ──────────────────────────► ┌─────────────┐
//!   │ IDLE │                             │ DISPATCHING │ ── settle (count > 0)
//!   └──────┘ ◄────────────────────────── └─────────────┘ ◄─┘
//!              last action settles: resolve waiters
//! ```
//!
//! The gate (`DISABLED`) is orthogonal and only consulted at dispatch time:
//! disabling a type never affects actions already queued.
//!
//! # Example
//!
//! ```
//! use keystone_runtime::config::RuntimeConfig;
//! use keystone_runtime::context::Context;
//! use keystone_runtime::dispatcher::Dispatcher;
//! use keystone_core::change::{ChangeSource, ChangeType};
//! use keystone_core::lifecycle::{Lifecycle, LifecycleConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let context = Context::new(RuntimeConfig::default());
//! let dispatcher = Dispatcher::new(&context).into_component();
//! dispatcher.register_action(ChangeType::Login, "load-profile", |_payload| async {});
//!
//! dispatcher.initialize(&LifecycleConfig::default()).await.unwrap();
//! context.bus().emit_change(ChangeType::Login, serde_json::json!({}), ChangeSource::UserAction);
//!
//! dispatcher
//!     .wait_for_change_actions(ChangeType::Login, Duration::from_secs(5))
//!     .await
//!     .unwrap();
//! # }
//! ```

use crate::bus::ChangeBus;
use crate::component::{Component, Hooks, Scope};
use crate::context::Context;
use crate::error::DispatchError;
use crate::lock;
use crate::metrics::DispatcherMetrics;
use crate::progress::{DispatchKey, DispatchProgress, ProgressMap, ProgressTracker};
use crate::queue::{ActionQueue, ActionTicket};
use crate::registry::Registry;
use futures::FutureExt;
use keystone_core::action::{Action, IntoActionResult};
use keystone_core::change::{ChangeEvent, ChangeType};
use keystone_core::environment::Clock;
use keystone_core::lifecycle::{LifecycleConfig, LifecycleFuture};
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};

/// A dispatcher wrapped as a lifecycle component.
pub type ActionDispatcher = Component<Dispatcher>;

/// Name the dispatcher component registers under in logs and metrics.
pub const DISPATCHER_NAME: &str = "action-dispatcher";

/// Canonical gate configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePreset {
    /// First-run flow: only the types that drive onboarding
    FirstRun,
    /// App startup: first-run types plus sign-up
    AppInit,
    /// Steady state: every supported type
    Normal,
}

impl GatePreset {
    const FIRST_RUN: [ChangeType; 6] = [
        ChangeType::AppInitDone,
        ChangeType::Ftux,
        ChangeType::FtuxComplete,
        ChangeType::Login,
        ChangeType::Logout,
        ChangeType::UserProfileGenerateSummary,
    ];

    /// The change types this preset enables (before filtering by support).
    #[must_use]
    pub fn change_types(self) -> Vec<ChangeType> {
        match self {
            Self::FirstRun => Self::FIRST_RUN.to_vec(),
            Self::AppInit => {
                let mut types = Self::FIRST_RUN.to_vec();
                types.push(ChangeType::Signup);
                types
            },
            Self::Normal => ChangeType::ALL.to_vec(),
        }
    }
}

/// Counter plus the waiters parked on it.
#[derive(Default)]
struct Outstanding {
    count: usize,
    waiters: Vec<oneshot::Sender<()>>,
}

struct DispatchState {
    supported: HashSet<ChangeType>,
    enabled: HashSet<ChangeType>,
    actions: HashMap<ChangeType, SmallVec<[Action; 4]>>,
    outstanding: HashMap<ChangeType, Outstanding>,
    deferred: Vec<Arc<ChangeEvent>>,
    app_init_seen: bool,
}

struct DispatchShared {
    bus: ChangeBus,
    queue: ActionQueue,
    clock: Arc<dyn Clock>,
    defer_until_app_init: bool,
    state: Mutex<DispatchState>,
    progress: ProgressTracker,
}

/// Change-type gated action dispatcher.
///
/// Wrap it with [`into_component`](Self::into_component): the bus
/// subscription and the gate only exist while the component is held.
pub struct Dispatcher {
    shared: Arc<DispatchShared>,
    registry: Registry,
    default_wait_timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher supporting every change type.
    #[must_use]
    pub fn new(context: &Context) -> Self {
        Self::with_supported(context, ChangeType::ALL)
    }

    /// Create a dispatcher that only ever enables `supported` types.
    #[must_use]
    pub fn with_supported(context: &Context, supported: impl IntoIterator<Item = ChangeType>) -> Self {
        let config = context.config();
        Self {
            shared: Arc::new(DispatchShared {
                bus: context.bus().clone(),
                queue: ActionQueue::new("dispatcher", config.max_concurrent_actions),
                clock: context.clock(),
                defer_until_app_init: config.defer_until_app_init,
                state: Mutex::new(DispatchState {
                    supported: supported.into_iter().collect(),
                    enabled: HashSet::new(),
                    actions: HashMap::new(),
                    outstanding: HashMap::new(),
                    deferred: Vec::new(),
                    app_init_seen: false,
                }),
                progress: ProgressTracker::new(),
            }),
            registry: context.registry().clone(),
            default_wait_timeout: config.default_wait_timeout,
        }
    }

    /// Wrap the dispatcher as a lifecycle component named [`DISPATCHER_NAME`].
    #[must_use]
    pub fn into_component(self) -> ActionDispatcher {
        let registry = self.registry.clone();
        Component::new(DISPATCHER_NAME, &registry, self)
    }

    /// The queue actions run on.
    #[must_use]
    pub fn queue(&self) -> &ActionQueue {
        &self.shared.queue
    }

    // Registration

    /// Register one action for `change_type`. Registrations are additive and
    /// survive teardown.
    pub fn register_action<F, Fut, R>(&self, change_type: ChangeType, name: impl Into<String>, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoActionResult + 'static,
    {
        let action = Action::new(change_type, name, handler);
        self.register_actions(change_type, [action]);
    }

    /// Append `actions` to the list for `change_type`, keeping their order.
    ///
    /// Actions built for another change type are skipped. Returns the number
    /// of actions registered.
    pub fn register_actions(&self, change_type: ChangeType, actions: impl IntoIterator<Item = Action>) -> usize {
        let mut state = lock(&self.shared.state);
        let list = state.actions.entry(change_type).or_default();
        let before = list.len();

        for action in actions {
            if action.change_type() == change_type {
                list.push(action);
            } else {
                tracing::warn!(
                    %change_type,
                    action = action.name(),
                    action_type = %action.change_type(),
                    "Skipping action built for another change type"
                );
            }
        }

        let added = list.len() - before;
        tracing::debug!(
            %change_type,
            added,
            actions = ?list.iter().map(Action::name).collect::<Vec<_>>(),
            "Registered actions"
        );
        added
    }

    /// Actions registered for `change_type`, in registration order.
    #[must_use]
    pub fn get_actions(&self, change_type: ChangeType) -> Vec<Action> {
        lock(&self.shared.state)
            .actions
            .get(&change_type)
            .map(|actions| actions.to_vec())
            .unwrap_or_default()
    }

    /// First action named `name` for `change_type`.
    ///
    /// Duplicate names are allowed; later registrations under the same name
    /// still run but are shadowed here.
    #[must_use]
    pub fn get_action(&self, change_type: ChangeType, name: &str) -> Option<Action> {
        lock(&self.shared.state)
            .actions
            .get(&change_type)?
            .iter()
            .find(|action| action.name() == name)
            .cloned()
    }

    /// Every registration, keyed by change type.
    #[must_use]
    pub fn get_all_actions(&self) -> BTreeMap<ChangeType, Vec<Action>> {
        lock(&self.shared.state)
            .actions
            .iter()
            .filter(|(_, actions)| !actions.is_empty())
            .map(|(change_type, actions)| (*change_type, actions.to_vec()))
            .collect()
    }

    // Gate

    /// Enable a supported change type. Returns `false` for unsupported types.
    pub fn enable_change_type(&self, change_type: ChangeType) -> bool {
        let mut state = lock(&self.shared.state);
        if !state.supported.contains(&change_type) {
            tracing::debug!(%change_type, "Not enabling unsupported change type");
            return false;
        }
        state.enabled.insert(change_type);
        true
    }

    /// Disable a change type. Returns whether it was enabled.
    pub fn disable_change_type(&self, change_type: ChangeType) -> bool {
        lock(&self.shared.state).enabled.remove(&change_type)
    }

    /// Enable exactly the supported types.
    pub fn enable_all_change_types(&self) {
        self.shared.enable_all();
    }

    /// Disable every type.
    pub fn disable_all_change_types(&self) {
        lock(&self.shared.state).enabled.clear();
    }

    /// Whether events of `change_type` are currently dispatched.
    #[must_use]
    pub fn is_change_type_enabled(&self, change_type: ChangeType) -> bool {
        lock(&self.shared.state).enabled.contains(&change_type)
    }

    /// Enabled change types, sorted.
    #[must_use]
    pub fn get_enabled_change_types(&self) -> Vec<ChangeType> {
        let mut enabled: Vec<_> = lock(&self.shared.state).enabled.iter().copied().collect();
        enabled.sort_unstable();
        enabled
    }

    /// Replace the gate with a preset, restricted to supported types.
    pub fn apply_preset(&self, preset: GatePreset) {
        let mut state = lock(&self.shared.state);
        let enabled: HashSet<_> = preset
            .change_types()
            .into_iter()
            .filter(|change_type| state.supported.contains(change_type))
            .collect();
        tracing::info!(?preset, enabled = enabled.len(), "Applying gate preset");
        state.enabled = enabled;
    }

    // Outstanding work

    /// Queued or running actions for `change_type`.
    #[must_use]
    pub fn outstanding(&self, change_type: ChangeType) -> usize {
        self.shared.outstanding(change_type)
    }

    /// Wait until no action dispatched for `change_type` is queued or running.
    ///
    /// Returns immediately when nothing is outstanding. Concurrent waiters on
    /// the same type all resolve together. A timeout does not cancel any
    /// action.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::WaitTimeout`] if work is still outstanding
    /// after `timeout`.
    pub async fn wait_for_change_actions(
        &self,
        change_type: ChangeType,
        timeout: Duration,
    ) -> Result<(), DispatchError> {
        let waiter = {
            let mut state = lock(&self.shared.state);
            match state.outstanding.get_mut(&change_type) {
                Some(entry) if entry.count > 0 => {
                    entry.waiters.retain(|waiter| !waiter.is_closed());
                    let (tx, rx) = oneshot::channel();
                    entry.waiters.push(tx);
                    rx
                },
                _ => return Ok(()),
            }
        };

        // A dropped sender means the dispatcher itself is gone; nothing is left to wait for.
        if tokio::time::timeout(timeout, waiter).await.is_ok() {
            return Ok(());
        }

        let outstanding = self.outstanding(change_type);
        tracing::warn!(%change_type, ?timeout, outstanding, "Timed out waiting for change actions");
        DispatcherMetrics::record_wait_timeout(change_type);
        Err(DispatchError::WaitTimeout {
            change_type,
            timeout,
            outstanding,
        })
    }

    /// [`wait_for_change_actions`](Self::wait_for_change_actions) with the
    /// configured default timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::WaitTimeout`] on timeout.
    pub async fn wait_for_change_actions_default(&self, change_type: ChangeType) -> Result<(), DispatchError> {
        self.wait_for_change_actions(change_type, self.default_wait_timeout).await
    }

    // Progress

    /// Latest dispatch record for `change_type`.
    #[must_use]
    pub fn progress(&self, change_type: ChangeType) -> Option<DispatchProgress> {
        self.shared.progress.get(change_type)
    }

    /// Observe every progress update.
    #[must_use]
    pub fn watch_progress(&self) -> watch::Receiver<ProgressMap> {
        self.shared.progress.watch()
    }

    /// Events buffered while waiting for `APP_INIT_DONE`.
    #[must_use]
    pub fn deferred_events(&self) -> usize {
        lock(&self.shared.state).deferred.len()
    }
}

impl Hooks for Dispatcher {
    fn on_initialize<'a>(&'a self, scope: &'a Scope, _config: &'a LifecycleConfig) -> LifecycleFuture<'a> {
        Box::pin(async move {
            let shared = Arc::downgrade(&self.shared);
            scope.on_change(&self.shared.bus, move |event: &Arc<ChangeEvent>| {
                if let Some(shared) = shared.upgrade() {
                    shared.handle_event(event);
                }
            });
            self.shared.enable_all();
            Ok(true)
        })
    }

    fn on_end<'a>(&'a self, _scope: &'a Scope, _config: &'a LifecycleConfig) -> LifecycleFuture<'a> {
        Box::pin(async move {
            {
                let mut state = lock(&self.shared.state);
                state.enabled.clear();
                state.deferred.clear();
                state.app_init_seen = false;
            }
            self.shared.progress.clear();
            Ok(true)
        })
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue", &self.shared.queue)
            .field("enabled", &self.get_enabled_change_types())
            .finish_non_exhaustive()
    }
}

impl DispatchShared {
    fn enable_all(&self) {
        let mut state = lock(&self.state);
        state.enabled = state.supported.clone();
    }

    fn outstanding(&self, change_type: ChangeType) -> usize {
        lock(&self.state)
            .outstanding
            .get(&change_type)
            .map_or(0, |entry| entry.count)
    }

    /// Bus callback. Runs synchronously inside `emit_change`.
    fn handle_event(self: &Arc<Self>, event: &Arc<ChangeEvent>) {
        let batch = {
            let mut state = lock(&self.state);
            if !self.defer_until_app_init || state.app_init_seen {
                vec![Arc::clone(event)]
            } else if event.change_type == ChangeType::AppInitDone {
                state.app_init_seen = true;
                let mut batch = std::mem::take(&mut state.deferred);
                tracing::info!(deferred = batch.len(), "App init done, replaying deferred events");
                batch.push(Arc::clone(event));
                batch
            } else {
                tracing::debug!(change_type = %event.change_type, "Deferring event until app init");
                state.deferred.push(Arc::clone(event));
                return;
            }
        };

        for event in batch {
            self.dispatch(&event);
        }
    }

    #[tracing::instrument(skip_all, fields(change_type = %event.change_type, dispatch_id = %event.dispatch_id()))]
    fn dispatch(self: &Arc<Self>, event: &Arc<ChangeEvent>) {
        let change_type = event.change_type;

        let actions = {
            let mut state = lock(&self.state);
            if !state.enabled.contains(&change_type) {
                tracing::debug!(source = %event.source, "Skipping disabled change type");
                DispatcherMetrics::record_gated(change_type);
                return;
            }
            let actions = state.actions.get(&change_type).cloned().unwrap_or_default();
            if actions.is_empty() {
                tracing::debug!("No actions registered for change type");
                return;
            }
            state.outstanding.entry(change_type).or_default().count += actions.len();
            actions
        };

        let names: Vec<String> = actions.iter().map(|action| action.name().to_string()).collect();
        let key = self.progress.begin(event, &names, self.clock.now());
        tracing::info!(actions = actions.len(), "Dispatching change actions");

        for (index, action) in actions.into_iter().enumerate() {
            DispatcherMetrics::record_dispatch(change_type);
            let guard = OutstandingGuard {
                shared: Arc::clone(self),
                change_type,
            };
            let name = action.name().to_string();
            let payload = event.payload.clone();
            let progress = self.progress.clone();

            let ticket = self.queue.execute_action(move || {
                progress.action_started(key, index);
                action.invoke(payload)
            });

            let settle = Arc::clone(self).settle(key, index, name, ticket, guard, Instant::now());
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(settle);
                },
                // Without a runtime the queue has already failed the ticket.
                Err(_) => {
                    let _ = settle.now_or_never();
                },
            }
        }
    }

    async fn settle(
        self: Arc<Self>,
        key: DispatchKey,
        index: usize,
        name: String,
        ticket: ActionTicket,
        guard: OutstandingGuard,
        dispatched_at: Instant,
    ) {
        let change_type = guard.change_type;
        let result = ticket.await;

        if let Err(error) = &result {
            tracing::warn!(%change_type, action = %name, %error, "Change action failed");
        } else {
            tracing::debug!(%change_type, action = %name, "Change action completed");
        }
        DispatcherMetrics::record_completion(change_type, dispatched_at.elapsed(), result.is_ok());
        self.progress.action_settled(key, index, &result, self.clock.now());

        drop(guard);
    }

    fn release(&self, change_type: ChangeType) {
        let waiters = {
            let mut state = lock(&self.state);
            let Some(entry) = state.outstanding.get_mut(&change_type) else {
                return;
            };
            entry.count = entry.count.saturating_sub(1);
            if entry.count > 0 {
                return;
            }
            std::mem::take(&mut entry.waiters)
        };

        tracing::debug!(%change_type, waiters = waiters.len(), "Change actions settled");
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
}

/// Releases one unit of a type's outstanding count when dropped.
struct OutstandingGuard {
    shared: Arc<DispatchShared>,
    change_type: ChangeType,
}

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.shared.release(self.change_type);
    }
}
