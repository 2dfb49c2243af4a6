//! Dependency registry: the resolution boundary used by lifecycle components.
//!
//! Values are stored type-erased under a [`Token`] name. Components
//! registered through [`Registry::register_component`] additionally carry
//! their [`Lifecycle`] view, which is what lets
//! [`Scope::add_dependency`](crate::component::Scope::add_dependency) cascade
//! `initialize`/`end` into them. Plain values pass through untouched.
//!
//! One registry maps each token to one shared instance; owners holding that
//! instance keep independent hold counts on it.
//!
//! # Example
//!
//! ```
//! use keystone_runtime::registry::Registry;
//! use keystone_core::registry::Token;
//! use std::sync::Arc;
//!
//! struct ApiUrl(&'static str);
//! const API_URL: Token<ApiUrl> = Token::new("api-url");
//!
//! let registry = Registry::new();
//! registry.register_value(&API_URL, Arc::new(ApiUrl("https://example.invalid")));
//! assert_eq!(registry.resolve(&API_URL).unwrap().0, "https://example.invalid");
//! ```

use crate::lock;
use keystone_core::lifecycle::Lifecycle;
use keystone_core::registry::{RegistryError, Token};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A resolved registry entry.
#[derive(Clone)]
pub struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    lifecycle: Option<Arc<dyn Lifecycle>>,
}

impl Entry {
    /// The lifecycle view, when the instance was registered as a component.
    #[must_use]
    pub fn lifecycle(&self) -> Option<&Arc<dyn Lifecycle>> {
        self.lifecycle.as_ref()
    }

    fn downcast<T: Any + Send + Sync>(&self, token: &str) -> Result<Arc<T>, RegistryError> {
        Arc::clone(&self.value)
            .downcast::<T>()
            .map_err(|_| RegistryError::TypeMismatch {
                token: token.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }
}

/// Shared token → instance map.
///
/// Cloning is cheap and yields a handle to the same map.
#[derive(Clone, Default)]
pub struct Registry {
    entries: Arc<Mutex<HashMap<&'static str, Entry>>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plain value, replacing any previous registration.
    pub fn register_value<T>(&self, token: &Token<T>, value: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        self.insert(token.name(), Entry {
            value,
            lifecycle: None,
        });
    }

    /// Register a lifecycle component, replacing any previous registration.
    pub fn register_component<T>(&self, token: &Token<T>, component: Arc<T>)
    where
        T: Lifecycle + Any,
    {
        let lifecycle: Arc<dyn Lifecycle> = Arc::clone(&component) as Arc<dyn Lifecycle>;
        self.insert(token.name(), Entry {
            value: component,
            lifecycle: Some(lifecycle),
        });
    }

    /// Remove a registration. Returns whether anything was removed.
    pub fn unregister<T: ?Sized>(&self, token: &Token<T>) -> bool {
        lock(&self.entries).remove(token.name()).is_some()
    }

    /// Whether the token is registered.
    #[must_use]
    pub fn contains<T: ?Sized>(&self, token: &Token<T>) -> bool {
        lock(&self.entries).contains_key(token.name())
    }

    /// Resolve a token to its instance.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotRegistered`] if nothing is registered and
    /// [`RegistryError::TypeMismatch`] if the instance is of another type.
    pub fn resolve<T>(&self, token: &Token<T>) -> Result<Arc<T>, RegistryError>
    where
        T: Any + Send + Sync,
    {
        self.entry(token)?.downcast(token.name())
    }

    /// Resolve a token, returning `None` on any failure.
    #[must_use]
    pub fn resolve_safe<T>(&self, token: &Token<T>) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.resolve(token).ok()
    }

    /// Resolve the raw entry (value plus optional lifecycle view).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotRegistered`] if nothing is registered.
    pub fn entry<T: ?Sized>(&self, token: &Token<T>) -> Result<Entry, RegistryError> {
        lock(&self.entries)
            .get(token.name())
            .cloned()
            .ok_or_else(|| RegistryError::NotRegistered(token.name().to_string()))
    }

    fn insert(&self, name: &'static str, entry: Entry) {
        if lock(&self.entries).insert(name, entry).is_some() {
            tracing::debug!(token = name, "Replaced registry entry");
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = lock(&self.entries);
        let mut names: Vec<_> = entries.keys().copied().collect();
        names.sort_unstable();
        f.debug_struct("Registry").field("entries", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    struct Settings {
        retries: u32,
    }

    const SETTINGS: Token<Settings> = Token::new("settings");
    const WRONG: Token<String> = Token::new("settings");
    const MISSING: Token<Settings> = Token::new("missing");

    #[test]
    fn resolves_registered_values() {
        let registry = Registry::new();
        registry.register_value(&SETTINGS, Arc::new(Settings { retries: 3 }));
        assert_eq!(registry.resolve(&SETTINGS).unwrap().retries, 3);
        assert!(registry.entry(&SETTINGS).unwrap().lifecycle().is_none());
    }

    #[test]
    fn resolution_errors_are_typed() {
        let registry = Registry::new();
        registry.register_value(&SETTINGS, Arc::new(Settings { retries: 3 }));

        assert_eq!(
            registry.resolve(&MISSING).err(),
            Some(RegistryError::NotRegistered("missing".to_string()))
        );
        assert!(matches!(
            registry.resolve(&WRONG),
            Err(RegistryError::TypeMismatch { .. })
        ));
        assert!(registry.resolve_safe(&MISSING).is_none());
    }

    #[test]
    fn resolving_twice_yields_the_same_instance() {
        let registry = Registry::new();
        registry.register_value(&SETTINGS, Arc::new(Settings { retries: 1 }));
        let a = registry.resolve(&SETTINGS).unwrap();
        let b = registry.resolve(&SETTINGS).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn unregister_removes_entry() {
        let registry = Registry::new();
        registry.register_value(&SETTINGS, Arc::new(Settings { retries: 1 }));
        assert!(registry.unregister(&SETTINGS));
        assert!(!registry.contains(&SETTINGS));
        assert!(!registry.unregister(&SETTINGS));
    }
}
