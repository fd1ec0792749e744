//! # fsmkit-core
//!
//! Embeddable finite-state-machine engine.
//!
//! This crate provides:
//! - Machine definitions, built in code or loaded from JSON/YAML documents
//! - A registry of validated definitions
//! - Guard expressions and closure guards, evaluated fail-closed
//! - Transition actions
//! - Per-entity state records behind a pluggable [`StateStore`]
//! - Change notification through a [`ChangeNotifier`]

pub mod action;
pub mod definition;
pub mod engine;
pub mod error;
pub mod guard;
pub mod lock;
pub mod notify;
pub mod record;
pub mod registry;
pub mod store;

pub use action::{Action, ActionContext, ActionExecutor, HandlerTable};
pub use definition::{MachineDefinition, MachineDefinitionRaw, TransitionRaw, TransitionSpec};
pub use engine::{EngineOptions, StateMachineEngine};
pub use error::{ActionError, CoreError, GuardError, StoreError};
pub use guard::{Guard, GuardEvaluator, GuardExpr, GuardInput};
pub use lock::LockingMode;
pub use notify::{ChangeEvent, ChangeNotifier, NoopNotifier, NotifyError, ObserverList};
pub use record::{store_key, Context, StateRecord};
pub use registry::Registry;
pub use store::{MemoryStore, StateStore};
