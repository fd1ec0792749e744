//! Machine definition registry.

use crate::definition::MachineDefinition;
use crate::error::CoreError;
use dashmap::DashMap;
use std::sync::Arc;

/// Holds validated machine definitions keyed by machine id.
///
/// Definitions are immutable once registered; registering the same id again
/// replaces the previous definition.
#[derive(Debug, Default)]
pub struct Registry {
    definitions: DashMap<String, Arc<MachineDefinition>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a definition.
    pub fn register(&self, definition: MachineDefinition) -> Result<Arc<MachineDefinition>, CoreError> {
        definition.validate()?;

        let id = definition.id().to_string();
        let definition = Arc::new(definition);

        if self
            .definitions
            .insert(id.clone(), definition.clone())
            .is_some()
        {
            tracing::warn!(machine = %id, "replaced existing machine definition");
        } else {
            tracing::info!(
                machine = %id,
                states = definition.states().len(),
                transitions = definition.transitions().len(),
                "registered machine definition"
            );
        }

        Ok(definition)
    }

    /// Looks up a definition by machine id.
    pub fn get(&self, machine_id: &str) -> Option<Arc<MachineDefinition>> {
        self.definitions.get(machine_id).map(|r| r.clone())
    }

    /// Like [`get`](Self::get), but fails with `MachineNotFound`.
    pub fn require(&self, machine_id: &str) -> Result<Arc<MachineDefinition>, CoreError> {
        self.get(machine_id)
            .ok_or_else(|| CoreError::MachineNotFound {
                machine: machine_id.to_string(),
            })
    }

    pub fn contains(&self, machine_id: &str) -> bool {
        self.definitions.contains_key(machine_id)
    }

    /// Returns all registered machine ids, sorted.
    pub fn machine_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.definitions.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
