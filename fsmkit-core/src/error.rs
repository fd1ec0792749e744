//! Core error types.

use thiserror::Error;

/// Errors from the state machine engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("machine not found: {machine}")]
    MachineNotFound { machine: String },

    #[error("no state record for {machine}/{entity}")]
    StateNotFound { machine: String, entity: String },

    #[error("state record already exists for {machine}/{entity}")]
    AlreadyInitialized { machine: String, entity: String },

    #[error("{machine}/{entity} is in terminal state '{state}'")]
    TerminalState {
        machine: String,
        entity: String,
        state: String,
    },

    #[error("no transition for event '{event}' in state '{state}'")]
    NoApplicableTransition { state: String, event: String },

    #[error("guard rejected event '{event}' in state '{state}'")]
    GuardRejected { state: String, event: String },

    #[error("action failed on event '{event}': {source}")]
    ActionFailed {
        event: String,
        #[source]
        source: ActionError,
    },

    #[error("state '{state}' is not defined by machine '{machine}'")]
    InvalidState { machine: String, state: String },

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("invalid machine definition: {reason}")]
    DefinitionInvalid { reason: String },

    #[error("invalid guard expression: {reason}")]
    InvalidGuard { reason: String },
}

impl CoreError {
    pub(crate) fn invalid_definition(reason: impl Into<String>) -> Self {
        CoreError::DefinitionInvalid {
            reason: reason.into(),
        }
    }

    /// Returns whether this error indicates the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Persistence(e) if e.is_retryable())
    }

    /// Returns a stable error code suitable for logs and CLI output.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::MachineNotFound { .. } => "MACHINE_NOT_FOUND",
            CoreError::StateNotFound { .. } => "STATE_NOT_FOUND",
            CoreError::AlreadyInitialized { .. } => "ALREADY_INITIALIZED",
            CoreError::TerminalState { .. } => "TERMINAL_STATE",
            CoreError::NoApplicableTransition { .. } => "NO_APPLICABLE_TRANSITION",
            CoreError::GuardRejected { .. } => "GUARD_REJECTED",
            CoreError::ActionFailed { .. } => "ACTION_FAILED",
            CoreError::InvalidState { .. } => "INVALID_STATE",
            CoreError::Persistence(_) => "PERSISTENCE_ERROR",
            CoreError::DefinitionInvalid { .. } => "DEFINITION_INVALID",
            CoreError::InvalidGuard { .. } => "DEFINITION_INVALID",
        }
    }
}

/// Errors raised by a [`StateStore`](crate::store::StateStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Backend(Box<dyn std::error::Error + Send + Sync>),

    /// A backend error the caller may retry (busy database, lock timeout).
    #[error("transient: {0}")]
    Transient(Box<dyn std::error::Error + Send + Sync>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    /// Wraps an arbitrary backend error.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend(Box::new(err))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Error returned by a transition action.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ActionError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an action error that keeps the underlying cause.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Error raised while evaluating a guard predicate.
///
/// Never surfaces to engine callers: the evaluator logs it and treats the
/// guard as failed.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("missing binding: {0}")]
    MissingBinding(String),

    #[error("type mismatch for '{field}': expected {expected}")]
    TypeMismatch { field: String, expected: &'static str },

    #[error("{0}")]
    Other(String),
}
