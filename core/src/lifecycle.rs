//! The lifecycle contract: reference-counted `initialize` / `end`.
//!
//! Every call to [`Lifecycle::initialize`] takes one *hold* on the component
//! and must be matched by exactly one [`Lifecycle::end`]. Only the first hold
//! performs setup and only the release of the last hold performs teardown.
//!
//! # Failure asymmetry
//!
//! - **Initialization is fail-fast**: the first dependency that fails (or
//!   declines with `Ok(false)`) aborts the walk, and the component's own setup
//!   never runs.
//! - **Teardown is continue-on-error**: every dependency is ended even when an
//!   earlier one fails; failures are collected into
//!   [`LifecycleError::TeardownFailed`].

use crate::registry::RegistryError;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by lifecycle transitions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    /// A declared dependency failed to initialize
    #[error("{component}: dependency '{dependency}' failed to initialize: {reason}")]
    DependencyFailed {
        /// The component being initialized
        component: String,
        /// The dependency that failed
        dependency: String,
        /// The dependency's own error
        reason: Box<LifecycleError>,
    },

    /// A declared dependency completed its transition but reported `false`
    #[error("{component}: dependency '{dependency}' did not return true")]
    DependencyDeclined {
        /// The component being initialized
        component: String,
        /// The dependency that declined
        dependency: String,
    },

    /// The component's own setup hook failed
    #[error("{component}: setup failed: {reason}")]
    SetupFailed {
        /// The failing component
        component: String,
        /// Description of the failure
        reason: String,
    },

    /// One of the component's own hooks completed but reported `false`
    #[error("{component}: {hook} hook did not return true")]
    HookDeclined {
        /// The component
        component: String,
        /// Which hook declined
        hook: &'static str,
    },

    /// Teardown finished but one or more steps failed
    #[error("{component}: teardown failed ({} error(s))", .failures.len())]
    TeardownFailed {
        /// The component being torn down
        component: String,
        /// Every failure encountered, in order
        failures: Vec<LifecycleError>,
    },

    /// `end()` was called without a matching `initialize()`
    #[error("{component}: end() called without an outstanding hold")]
    NotHeld {
        /// The component
        component: String,
    },

    /// A dependency could not be resolved
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl LifecycleError {
    /// Convenience constructor for hook implementations.
    pub fn setup(component: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::SetupFailed {
            component: component.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result of a lifecycle transition. `Ok(false)` means "completed but declined".
pub type LifecycleResult = Result<bool, LifecycleError>;

/// Returns `true` only for `Ok(true)`.
#[must_use]
pub const fn is_result_true(result: &LifecycleResult) -> bool {
    matches!(result, Ok(true))
}

/// Free-form configuration forwarded through a dependency cascade.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LifecycleConfig {
    values: Map<String, Value>,
}

impl LifecycleConfig {
    /// Empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key/value pair.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Look up a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

/// Opaque per-activation token, refreshed on every full teardown.
///
/// Callers memoizing on "this instance, this activation" compare generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generation(u64);

impl Generation {
    /// Wrap a raw value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Boxed future returned by lifecycle transitions.
pub type LifecycleFuture<'a> = Pin<Box<dyn Future<Output = LifecycleResult> + Send + 'a>>;

/// Reference-counted lifecycle contract.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so components can be held as
/// `Arc<dyn Lifecycle>` inside dependency lists.
pub trait Lifecycle: Send + Sync {
    /// Human readable name used in logs and errors.
    fn name(&self) -> &str;

    /// Take one hold; the first hold performs setup.
    fn initialize<'a>(&'a self, config: &'a LifecycleConfig) -> LifecycleFuture<'a>;

    /// Release one hold; releasing the last hold performs teardown.
    fn end<'a>(&'a self, config: &'a LifecycleConfig) -> LifecycleFuture<'a>;

    /// Whether the current activation's setup succeeded.
    fn is_initialized(&self) -> bool;

    /// Number of outstanding holds.
    fn hold_count(&self) -> usize;
}
