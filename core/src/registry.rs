//! Typed injection tokens and resolution errors.
//!
//! The registry itself lives in the runtime crate; this module only defines
//! the vocabulary shared by anything that resolves dependencies.
//!
//! ```
//! use keystone_core::registry::Token;
//!
//! struct AuthService;
//! const AUTH: Token<AuthService> = Token::new("auth");
//! assert_eq!(AUTH.name(), "auth");
//! ```

use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

/// Name of a registered instance, typed by what it resolves to.
pub struct Token<T: ?Sized> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ?Sized> Token<T> {
    /// Create a token. Names must be unique within one registry.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// Registry key.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: ?Sized> Clone for Token<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for Token<T> {}

impl<T: ?Sized> fmt::Debug for Token<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Token").field(&self.name).finish()
    }
}

impl<T: ?Sized> fmt::Display for Token<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Errors from dependency resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Nothing is registered under the token
    #[error("Unable to resolve '{0}': not registered")]
    NotRegistered(String),

    /// Something is registered, but not of the requested type
    #[error("Unable to resolve '{token}': registered value is not a {expected}")]
    TypeMismatch {
        /// The token that was resolved
        token: String,
        /// Requested type name
        expected: &'static str,
    },
}
