//! The change bus: one observable slot holding the latest [`ChangeEvent`].
//!
//! Producers call [`ChangeBus::emit_change`]. The bus debounces per change
//! type: a call inside the debounce window of the last *accepted* event of
//! the same type is dropped, reported as [`EmitOutcome::Debounced`], and
//! does not move the window.
//!
//! Accepted events replace the current value and are delivered synchronously
//! to every subscriber, in subscription order, before `emit_change` returns.
//! Subscribers only see events published after they subscribed.
//!
//! ```text
//! emit_change(T) ──► debounce[T] ──drop──► EmitOutcome::Debounced
//!                        │
//!                     accept
//!                        ▼
//!                 current = event ──► subscriber 1, subscriber 2, ...
//!                        └──────────► watch receivers
//! ```
//!
//! # Example
//!
//! ```
//! use keystone_runtime::bus::ChangeBus;
//! use keystone_core::change::{ChangeSource, ChangeType};
//! use std::time::Duration;
//!
//! let bus = ChangeBus::new(Duration::from_millis(300));
//! let first = bus.emit_change(ChangeType::UserProfile, serde_json::json!({"field": "name"}), ChangeSource::UserAction);
//! let second = bus.emit_change(ChangeType::UserProfile, serde_json::json!({"field": "bio"}), ChangeSource::UserAction);
//!
//! assert!(first.is_accepted());
//! assert!(!second.is_accepted());
//! ```

use crate::lock;
use crate::metrics::ChangeBusMetrics;
use chrono::{DateTime, Utc};
use keystone_core::change::{ChangeEvent, ChangeSource, ChangeType};
use keystone_core::environment::{Clock, SystemClock};
use keystone_core::observable::{Handler, Observable, Subscription};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;

/// Result of [`ChangeBus::emit_change`].
#[derive(Debug, Clone, PartialEq)]
pub enum EmitOutcome {
    /// The event was published
    Accepted(Arc<ChangeEvent>),
    /// The call fell inside the debounce window and was dropped
    Debounced {
        /// Time since the last accepted event of this type
        since_last: Duration,
    },
}

impl EmitOutcome {
    /// Whether the event was published.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    /// The published event, if any.
    #[must_use]
    pub const fn event(&self) -> Option<&Arc<ChangeEvent>> {
        match self {
            Self::Accepted(event) => Some(event),
            Self::Debounced { .. } => None,
        }
    }
}

type EventHandler = Handler<Arc<ChangeEvent>>;

struct BusState {
    last_accepted: HashMap<ChangeType, DateTime<Utc>>,
    subscribers: Vec<(u64, EventHandler)>,
    next_subscriber: u64,
}

struct BusInner {
    debounce_window: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<BusState>,
    current: watch::Sender<Option<Arc<ChangeEvent>>>,
}

/// Debounced publish/subscribe slot for change events.
///
/// Cloning is cheap and yields a handle to the same bus.
#[derive(Clone)]
pub struct ChangeBus {
    inner: Arc<BusInner>,
}

impl ChangeBus {
    /// Create a bus using the system clock.
    #[must_use]
    pub fn new(debounce_window: Duration) -> Self {
        Self::with_clock(debounce_window, Arc::new(SystemClock))
    }

    /// Create a bus with an injected clock.
    #[must_use]
    pub fn with_clock(debounce_window: Duration, clock: Arc<dyn Clock>) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            inner: Arc::new(BusInner {
                debounce_window,
                clock,
                state: Mutex::new(BusState {
                    last_accepted: HashMap::new(),
                    subscribers: Vec::new(),
                    next_subscriber: 0,
                }),
                current,
            }),
        }
    }

    /// The configured debounce window.
    #[must_use]
    pub fn debounce_window(&self) -> Duration {
        self.inner.debounce_window
    }

    /// Publish a change unless the type is inside its debounce window.
    ///
    /// Subscribers run synchronously before this returns.
    #[tracing::instrument(skip_all, fields(change_type = %change_type, source = %source))]
    pub fn emit_change(
        &self,
        change_type: ChangeType,
        payload: serde_json::Value,
        source: ChangeSource,
    ) -> EmitOutcome {
        let now = self.inner.clock.now();

        let (event, subscribers) = {
            let mut state = lock(&self.inner.state);

            // A clock stepped backwards yields a negative delta, which is
            // outside any window; the accepted event then resets the baseline.
            let since_last = state
                .last_accepted
                .get(&change_type)
                .and_then(|last| (now - *last).to_std().ok())
                .filter(|since_last| *since_last < self.inner.debounce_window);
            if let Some(since_last) = since_last {
                tracing::debug!(
                    since_last_ms = since_last.as_millis(),
                    "Debouncing change event"
                );
                ChangeBusMetrics::record_debounced(change_type);
                return EmitOutcome::Debounced { since_last };
            }

            state.last_accepted.insert(change_type, now);

            let event = Arc::new(ChangeEvent::new(change_type, payload, now, source));
            let subscribers: Vec<EventHandler> = state
                .subscribers
                .iter()
                .map(|(_, handler)| Arc::clone(handler))
                .collect();
            (event, subscribers)
        };

        tracing::debug!(subscribers = subscribers.len(), "Emitting change event");
        ChangeBusMetrics::record_accepted(change_type);

        self.inner.current.send_replace(Some(Arc::clone(&event)));
        for handler in subscribers {
            handler(&event);
        }

        EmitOutcome::Accepted(event)
    }

    /// The most recently published event.
    #[must_use]
    pub fn current(&self) -> Option<Arc<ChangeEvent>> {
        self.inner.current.borrow().clone()
    }

    /// Register a synchronous handler for subsequent events.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Arc<ChangeEvent>) + Send + Sync + 'static,
    {
        self.on_change(Arc::new(handler))
    }

    /// Number of registered synchronous handlers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.state).subscribers.len()
    }

    /// Async view of the slot.
    ///
    /// The receiver treats the value current at subscribe time as already
    /// seen, so `changed()` only fires for later events.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Option<Arc<ChangeEvent>>> {
        self.inner.current.subscribe()
    }

    /// Forget all debounce timestamps.
    pub fn reset_debounce(&self) {
        lock(&self.inner.state).last_accepted.clear();
    }
}

impl Observable<Arc<ChangeEvent>> for ChangeBus {
    fn on_change(&self, handler: EventHandler) -> Subscription {
        let id = {
            let mut state = lock(&self.inner.state);
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            state.subscribers.push((id, handler));
            id
        };

        let bus: Weak<BusInner> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = bus.upgrade() {
                lock(&inner.state).subscribers.retain(|(sub, _)| *sub != id);
            }
        })
    }
}

impl std::fmt::Debug for ChangeBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeBus")
            .field("debounce_window", &self.inner.debounce_window)
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}
