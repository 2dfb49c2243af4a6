//! # Keystone Runtime
//!
//! Runtime implementation for Keystone.
//!
//! This crate wires the vocabulary of `keystone-core` into running services:
//! components that set up and tear down through reference-counted holds,
//! a debounced change bus, and a dispatcher that turns change events into
//! actions on a bounded queue.
//!
//! ## Core Components
//!
//! - **Component**: reference-counted lifecycle with a dependency cascade
//! - **Change Bus**: per-type debounced publish/subscribe of change events
//! - **Dispatcher**: type-gated action dispatch with outstanding-work counters
//! - **Action Queue**: FIFO runner with a concurrency limit
//! - **Context**: the registry, bus, clock and config passed to constructors
//!
//! ## Example
//!
//! ```
//! use keystone_runtime::{Context, Dispatcher, RuntimeConfig};
//! use keystone_core::change::{ChangeSource, ChangeType};
//! use keystone_core::lifecycle::{Lifecycle, LifecycleConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let context = Context::new(RuntimeConfig::default());
//! let dispatcher = Dispatcher::new(&context).into_component();
//! dispatcher.register_action(ChangeType::Signup, "send-welcome", |payload| async move {
//!     payload.get("email").is_some()
//! });
//!
//! let config = LifecycleConfig::default();
//! dispatcher.initialize(&config).await?;
//!
//! context.bus().emit_change(
//!     ChangeType::Signup,
//!     serde_json::json!({"email": "new@example.invalid"}),
//!     ChangeSource::UserAction,
//! );
//! dispatcher.wait_for_change_actions(ChangeType::Signup, Duration::from_secs(5)).await?;
//!
//! dispatcher.end(&config).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Debounced change bus
pub mod bus;

/// Reference-counted lifecycle components
pub mod component;

/// Runtime configuration
pub mod config;

/// Explicit runtime context
pub mod context;

/// Change-type gated action dispatch
pub mod dispatcher;

/// Prometheus metrics for observability
pub mod metrics;

/// Dispatch progress tracking
pub mod progress;

/// Bounded FIFO action queue
pub mod queue;

/// Dependency registry
pub mod registry;

/// Error types for the runtime
pub mod error {
    use keystone_core::change::ChangeType;
    use std::time::Duration;
    use thiserror::Error;

    /// Errors returned by the dispatcher
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum DispatchError {
        /// Actions for the change type were still queued or running at the deadline
        ///
        /// The actions keep running; only the wait gave up.
        #[error("Timed out after {timeout:?} waiting for {outstanding} {change_type} action(s)")]
        WaitTimeout {
            /// The change type waited on
            change_type: ChangeType,
            /// The timeout that elapsed
            timeout: Duration,
            /// Actions still outstanding when the wait gave up
            outstanding: usize,
        },
    }
}

pub use bus::{ChangeBus, EmitOutcome};
pub use component::{Component, Hooks, Scope};
pub use config::RuntimeConfig;
pub use context::Context;
pub use dispatcher::{ActionDispatcher, Dispatcher, GatePreset};
pub use error::DispatchError;
pub use progress::{ActionStatus, DispatchProgress, DispatchStatus};
pub use queue::{ActionQueue, ActionTicket};
pub use registry::Registry;

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// No critical section in this crate leaves its data half-updated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
