//! Actions: named asynchronous handlers invoked when a change is dispatched.
//!
//! Handlers may return `()`, `bool`, `Result<(), E>` or `Result<bool, E>`.
//! [`IntoActionResult`] normalizes all of them into an [`ActionResult`], so a
//! handler that has nothing to report does not need to invent a value:
//!
//! ```
//! use keystone_core::action::{Action, IntoActionResult};
//! use keystone_core::change::ChangeType;
//!
//! let action = Action::new(ChangeType::Login, "refresh-profile", |_payload| async {
//!     // ... talk to the back end ...
//! });
//! assert_eq!(action.name(), "refresh-profile");
//! assert_eq!(().into_action_result(), Ok(true));
//! ```

use crate::change::ChangeType;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Message used when a failure carries no description of its own.
pub const UNKNOWN_ACTION_ERROR: &str = "Unknown error in action queue";

/// Errors produced while running an action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// The handler reported a failure
    #[error("Action failed: {0}")]
    Failed(String),

    /// The handler panicked; the panic was contained at the queue boundary
    #[error("Action panicked: {0}")]
    Panicked(String),

    /// The queue was dropped before the action produced a result
    #[error("Action was abandoned before completion")]
    Abandoned,

    /// No async runtime was available to run the action
    #[error("No async runtime available to run action")]
    NoRuntime,
}

impl ActionError {
    /// Build a [`ActionError::Failed`] from any displayable error.
    pub fn failed(reason: impl fmt::Display) -> Self {
        let reason = reason.to_string();
        if reason.is_empty() {
            Self::Failed(UNKNOWN_ACTION_ERROR.to_string())
        } else {
            Self::Failed(reason)
        }
    }
}

impl From<String> for ActionError {
    fn from(reason: String) -> Self {
        Self::failed(reason)
    }
}

impl From<&str> for ActionError {
    fn from(reason: &str) -> Self {
        Self::failed(reason)
    }
}

/// Outcome of one action. `Ok(false)` is a soft "nothing done" result.
pub type ActionResult = Result<bool, ActionError>;

/// Conversion of handler return values into an [`ActionResult`].
pub trait IntoActionResult {
    /// Normalize into an [`ActionResult`].
    ///
    /// # Errors
    ///
    /// Returns the handler's own failure mapped into [`ActionError`].
    fn into_action_result(self) -> ActionResult;
}

impl IntoActionResult for () {
    fn into_action_result(self) -> ActionResult {
        Ok(true)
    }
}

impl IntoActionResult for bool {
    fn into_action_result(self) -> ActionResult {
        Ok(self)
    }
}

impl<E> IntoActionResult for Result<(), E>
where
    E: Into<ActionError>,
{
    fn into_action_result(self) -> ActionResult {
        self.map(|()| true).map_err(Into::into)
    }
}

impl<E> IntoActionResult for Result<bool, E>
where
    E: Into<ActionError>,
{
    fn into_action_result(self) -> ActionResult {
        self.map_err(Into::into)
    }
}

/// Boxed future returned by a type-erased action handler.
pub type ActionFuture = BoxFuture<'static, ActionResult>;

/// Type-erased action handler: receives the event payload.
pub type ActionHandler = Arc<dyn Fn(serde_json::Value) -> ActionFuture + Send + Sync>;

/// A named handler registered against a change type.
///
/// Cloning is cheap; the handler is shared.
#[derive(Clone)]
pub struct Action {
    name: String,
    change_type: ChangeType,
    handler: ActionHandler,
}

impl Action {
    /// Wrap an async closure as an action.
    pub fn new<F, Fut, R>(change_type: ChangeType, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoActionResult + 'static,
    {
        Self {
            name: name.into(),
            change_type,
            handler: Arc::new(move |payload| {
                handler(payload).map(IntoActionResult::into_action_result).boxed()
            }),
        }
    }

    /// Name used for lookup, logging and progress tracking.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Change type this action reacts to.
    #[must_use]
    pub const fn change_type(&self) -> ChangeType {
        self.change_type
    }

    /// Start the handler with the given payload.
    #[must_use]
    pub fn invoke(&self, payload: serde_json::Value) -> ActionFuture {
        (self.handler)(payload)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("change_type", &self.change_type)
            .finish_non_exhaustive()
    }
}
