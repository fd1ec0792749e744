//! Per-key serialization of read-modify-write cycles.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How the engine serializes concurrent operations on one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockingMode {
    /// One mutex per `(machine_id, entity_id)`, held from load to save.
    #[default]
    PerKey,
    /// No locking. Concurrent events on one record may overwrite each
    /// other's result (last save wins).
    None,
}

impl std::str::FromStr for LockingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "per_key" | "per-key" | "perkey" => Ok(LockingMode::PerKey),
            "none" | "off" => Ok(LockingMode::None),
            other => Err(format!("unknown locking mode '{}'", other)),
        }
    }
}

/// Lazily created mutexes keyed by `(machine_id, entity_id)`.
///
/// A slot lives while some caller holds or waits on it and is evicted by the
/// last one out.
#[derive(Debug)]
pub(crate) struct KeyLocks {
    mode: LockingMode,
    slots: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub(crate) fn new(mode: LockingMode) -> Self {
        Self {
            mode,
            slots: DashMap::new(),
        }
    }

    /// Runs `f` while holding the key's mutex (or unlocked when locking is
    /// disabled).
    ///
    /// The map shard lock is released before the mutex is taken, so
    /// unrelated keys never wait on each other. Waiters hold their own
    /// `Arc`, so the slot is only removed when the map holds the last
    /// reference.
    pub(crate) fn with_key<R>(&self, machine_id: &str, entity_id: &str, f: impl FnOnce() -> R) -> R {
        if self.mode == LockingMode::None {
            return f();
        }

        let key = (machine_id.to_string(), entity_id.to_string());
        let slot = self.slots.entry(key.clone()).or_default().clone();

        let result = {
            let _held = slot.lock();
            f()
        };

        drop(slot);
        self.slots.remove_if(&key, |_, m| Arc::strong_count(m) == 1);
        result
    }

    /// Number of live slots.
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}
