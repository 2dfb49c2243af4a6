//! # Keystone Core
//!
//! Core traits and types for Keystone: reference-counted component
//! lifecycles, change events, and the actions dispatched in response to them.
//!
//! This crate holds vocabulary only. The runtime crate provides the bounded
//! action queue, the change bus, the dependency registry, the lifecycle
//! component and the action dispatcher built on these types.
//!
//! ## Core Concepts
//!
//! - **Lifecycle**: `initialize`/`end` pairs counted as *holds*; setup runs on
//!   the first hold, teardown when the last hold is released
//! - **Change Event**: an immutable "something changed" notification keyed by
//!   a closed [`ChangeType`](change::ChangeType)
//! - **Action**: a named async handler registered against a change type
//! - **Subscription**: an explicit unsubscribe handle returned by observables
//! - **Clock**: injected time source so debouncing is testable
//!
//! ## Example
//!
//! ```
//! use keystone_core::action::Action;
//! use keystone_core::change::ChangeType;
//!
//! let refresh = Action::new(ChangeType::Login, "refresh-session", |payload| async move {
//!     let _user = payload.get("user_id").cloned();
//!     Ok::<_, String>(())
//! });
//! assert_eq!(refresh.change_type(), ChangeType::Login);
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde_json::Value;

/// Actions and their results
pub mod action;

/// Change types, sources and events
pub mod change;

/// The reference-counted lifecycle contract
pub mod lifecycle;

/// Subscriptions and observable sources
pub mod observable;

/// Typed injection tokens
pub mod registry;

/// Environment module - injected collaborators
///
/// All time-dependent behavior (debouncing, event timestamps, progress
/// records) reads the current time through [`Clock`](environment::Clock) so
/// tests can control it.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use keystone_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let earlier = clock.now();
    /// assert!(clock.now() >= earlier);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use action::{Action, ActionError, ActionResult, IntoActionResult};
pub use change::{ChangeEvent, ChangeSource, ChangeType};
pub use lifecycle::{Generation, Lifecycle, LifecycleConfig, LifecycleError, LifecycleResult};
pub use observable::{Observable, Subscription};
pub use registry::{RegistryError, Token};
