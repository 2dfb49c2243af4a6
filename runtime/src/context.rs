//! Explicit runtime context passed to constructors.
//!
//! Bundles everything that would otherwise be process-global: the
//! dependency [`Registry`], the [`ChangeBus`], the [`Clock`] and the
//! [`RuntimeConfig`]. Each test builds its own context, so no state leaks
//! between tests.

use crate::bus::ChangeBus;
use crate::config::RuntimeConfig;
use crate::registry::Registry;
use keystone_core::environment::{Clock, SystemClock};
use std::sync::Arc;

/// Shared runtime collaborators. Cloning is cheap.
#[derive(Clone)]
pub struct Context {
    registry: Registry,
    bus: ChangeBus,
    clock: Arc<dyn Clock>,
    config: RuntimeConfig,
}

impl Context {
    /// Build a context on the system clock.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build a context on an injected clock.
    ///
    /// ```
    /// use keystone_runtime::config::RuntimeConfig;
    /// use keystone_runtime::context::Context;
    /// use keystone_core::environment::SystemClock;
    /// use std::sync::Arc;
    ///
    /// let context = Context::with_clock(RuntimeConfig::default(), Arc::new(SystemClock));
    /// assert_eq!(context.bus().debounce_window(), context.config().debounce_window);
    /// ```
    #[must_use]
    pub fn with_clock(config: RuntimeConfig, clock: Arc<dyn Clock>) -> Self {
        let bus = ChangeBus::with_clock(config.debounce_window, Arc::clone(&clock));
        Self {
            registry: Registry::new(),
            bus,
            clock,
            config,
        }
    }

    /// Build a context from [`RuntimeConfig::from_env`].
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(RuntimeConfig::from_env())
    }

    /// The dependency registry.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The change bus.
    #[must_use]
    pub const fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    /// The clock.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("registry", &self.registry)
            .field("bus", &self.bus)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
