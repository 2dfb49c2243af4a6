//! Publish/subscribe primitives shared by the bus and lifecycle components.
//!
//! An [`Observable`] hands out a [`Subscription`] for each registered
//! handler. Dropping a subscription does **not** unsubscribe; cancellation is
//! always explicit through [`Subscription::unsubscribe`], so a lifecycle
//! component can collect subscriptions and release them in registration
//! order on teardown.

use std::fmt;
use std::sync::Arc;

/// Synchronous change handler.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by [`Observable::on_change`].
#[must_use = "a subscription must be kept to be able to unsubscribe"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap a cancellation callback.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to cancel.
    pub const fn noop() -> Self {
        Self { cancel: None }
    }

    /// Remove the handler from its observable. Runs the callback exactly once.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// A value source that notifies handlers of transitions.
///
/// Handlers are only told about values published after they subscribed.
pub trait Observable<T>: Send + Sync {
    /// Register `handler` for subsequent changes.
    fn on_change(&self, handler: Handler<T>) -> Subscription;
}
