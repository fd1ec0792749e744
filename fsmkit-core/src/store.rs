//! Persistence abstraction for state records.

use crate::error::StoreError;
use crate::record::StateRecord;
use dashmap::DashMap;

/// Persists one [`StateRecord`] per `(machine_id, entity_id)`.
///
/// Implementations must be safe to share between threads. `save` is an
/// upsert: a later save for the same key replaces the earlier record.
pub trait StateStore: Send + Sync {
    /// Inserts or replaces the record for its key.
    fn save(&self, record: &StateRecord) -> Result<(), StoreError>;

    /// Loads the record for a key, if any.
    fn find(&self, machine_id: &str, entity_id: &str) -> Result<Option<StateRecord>, StoreError>;

    /// Deletes the record for a key. Returns whether a record existed.
    fn remove(&self, machine_id: &str, entity_id: &str) -> Result<bool, StoreError>;

    fn exists(&self, machine_id: &str, entity_id: &str) -> Result<bool, StoreError> {
        Ok(self.find(machine_id, entity_id)?.is_some())
    }

    /// Entity ids with a record under `machine_id`, sorted.
    fn entities(&self, machine_id: &str) -> Result<Vec<String>, StoreError>;
}

/// In-memory store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<(String, String), StateRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl StateStore for MemoryStore {
    fn save(&self, record: &StateRecord) -> Result<(), StoreError> {
        self.records.insert(
            (record.machine_id.clone(), record.entity_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    fn find(&self, machine_id: &str, entity_id: &str) -> Result<Option<StateRecord>, StoreError> {
        Ok(self
            .records
            .get(&(machine_id.to_string(), entity_id.to_string()))
            .map(|r| r.clone()))
    }

    fn remove(&self, machine_id: &str, entity_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .records
            .remove(&(machine_id.to_string(), entity_id.to_string()))
            .is_some())
    }

    fn exists(&self, machine_id: &str, entity_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .records
            .contains_key(&(machine_id.to_string(), entity_id.to_string())))
    }

    fn entities(&self, machine_id: &str) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.key().0 == machine_id)
            .map(|r| r.key().1.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
