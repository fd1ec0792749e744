//! # fsmkit-storage
//!
//! Durable storage for fsmkit.
//!
//! This crate provides:
//! - A SQLite-backed [`StateStore`](fsmkit_core::StateStore)
//! - A directory loader for machine definition documents

pub mod error;
pub mod loader;
pub mod sqlite;

pub use error::StorageError;
pub use loader::{load_definition, DefinitionLoader};
pub use sqlite::{SqliteStore, SqliteStoreConfig, DEFAULT_TABLE};
