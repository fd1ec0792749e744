//! State change notification.

use crate::record::Context;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

/// Published after a state change has been persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub machine_id: String,
    pub entity_id: String,
    pub from_state: String,
    pub to_state: String,
    /// Triggering event; None for forced overrides.
    pub event: Option<String>,
    /// Record context after the change.
    pub context: Context,
    pub changed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn is_forced(&self) -> bool {
        self.event.is_none()
    }
}

/// Errors from publishing a change.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification queue full")]
    QueueFull,

    #[error("notification channel closed")]
    Closed,

    #[error("subscriber failed: {0}")]
    Subscriber(String),
}

/// Receives state changes from the engine.
///
/// Publishing happens after the record is saved; a failure is logged by the
/// engine and never undoes the change.
pub trait ChangeNotifier: Send + Sync {
    fn publish(&self, event: ChangeEvent) -> Result<(), NotifyError>;
}

/// Discards every change.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl ChangeNotifier for NoopNotifier {
    fn publish(&self, _event: ChangeEvent) -> Result<(), NotifyError> {
        Ok(())
    }
}

type ObserverFn = dyn Fn(&ChangeEvent) -> Result<(), NotifyError> + Send + Sync;

/// Synchronous in-process observers.
///
/// Every observer sees every change, even when an earlier one fails or
/// panics. A panic is reported as [`NotifyError::Subscriber`].
#[derive(Default)]
pub struct ObserverList {
    observers: RwLock<Vec<Arc<ObserverFn>>>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&ChangeEvent) -> Result<(), NotifyError> + Send + Sync + 'static,
    {
        self.observers.write().push(Arc::new(observer));
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }
}

impl ChangeNotifier for ObserverList {
    fn publish(&self, event: ChangeEvent) -> Result<(), NotifyError> {
        // Snapshot so observers may subscribe others without deadlocking.
        let observers: Vec<Arc<ObserverFn>> = self.observers.read().clone();

        let mut first_error = None;
        for observer in observers {
            let outcome = catch_unwind(AssertUnwindSafe(|| observer(&event)))
                .unwrap_or_else(|_| Err(NotifyError::Subscriber("observer panicked".to_string())));
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ObserverList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList")
            .field("observers", &self.len())
            .finish()
    }
}
