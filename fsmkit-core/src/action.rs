//! Transition actions.
//!
//! An action runs after its transition's guard passed and before the record
//! is persisted. It may read the event and write the in-hand context, but
//! cannot change the state: the engine owns that.

use crate::error::{ActionError, GuardError};
use crate::guard::{Guard, GuardInput};
use crate::record::Context;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Data an action sees while it runs.
pub struct ActionContext<'a> {
    pub machine_id: &'a str,
    pub entity_id: &'a str,
    pub from_state: &'a str,
    pub to_state: &'a str,
    pub event: &'a str,
    /// Payload of the triggering event.
    pub event_context: &'a Context,
    /// Record context about to be persisted. Writes are kept only if the
    /// whole transition commits.
    pub context: &'a mut Context,
}

/// Signature of an action handler.
pub type ActionFn = dyn Fn(&mut ActionContext<'_>) -> Result<(), ActionError> + Send + Sync;

/// A named transition action.
#[derive(Clone)]
pub struct Action {
    name: String,
    handler: Arc<ActionFn>,
}

impl Action {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Action").field(&self.name).finish()
    }
}

/// Runs transition actions.
pub struct ActionExecutor;

impl ActionExecutor {
    /// Executes an optional action (None = no-op).
    pub fn execute(
        action: Option<&Action>,
        ctx: &mut ActionContext<'_>,
    ) -> Result<(), ActionError> {
        let Some(action) = action else {
            return Ok(());
        };

        tracing::debug!(
            machine = ctx.machine_id,
            entity = ctx.entity_id,
            action = action.name(),
            "running action for '{}' -> '{}'",
            ctx.from_state,
            ctx.to_state
        );

        (action.handler)(ctx)
    }
}

/// Named guards and actions that declarative definitions refer to.
///
/// Documents reference actions by name and predicate guards as `@name`.
#[derive(Debug, Clone, Default)]
pub struct HandlerTable {
    actions: HashMap<String, Action>,
    guards: HashMap<String, Guard>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action handler under `name`.
    pub fn with_action<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        self.actions
            .insert(name.to_string(), Action::new(name, handler));
        self
    }

    /// Registers a guard predicate under `name`.
    pub fn with_guard<F>(mut self, name: &str, predicate: F) -> Self
    where
        F: Fn(&GuardInput<'_>) -> Result<bool, GuardError> + Send + Sync + 'static,
    {
        self.guards
            .insert(name.to_string(), Guard::predicate(name, predicate));
        self
    }

    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    pub fn guard(&self, name: &str) -> Option<&Guard> {
        self.guards.get(name)
    }
}
