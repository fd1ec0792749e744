//! Per-entity state records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key/value context attached to a record or carried by an event.
pub type Context = Map<String, Value>;

/// Separator between machine id and entity id in a store key.
pub const STORE_KEY_SEPARATOR: char = ':';

/// Builds the unique store key for a `(machine, entity)` pair.
pub fn store_key(machine_id: &str, entity_id: &str) -> String {
    format!("{}{}{}", machine_id, STORE_KEY_SEPARATOR, entity_id)
}

/// The tracked state of one entity under one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Machine definition id.
    pub machine_id: String,

    /// Entity id, unique within the machine.
    pub entity_id: String,

    /// Current state.
    pub current_state: String,

    /// State before the last change (None right after initialization).
    #[serde(default)]
    pub previous_state: Option<String>,

    /// Time of the last state change.
    pub state_changed_at: DateTime<Utc>,

    /// Entity context (mutable data).
    #[serde(default)]
    pub context: Context,
}

impl StateRecord {
    /// Creates a fresh record in the given initial state.
    pub fn new(
        machine_id: impl Into<String>,
        entity_id: impl Into<String>,
        initial_state: impl Into<String>,
        context: Context,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            entity_id: entity_id.into(),
            current_state: initial_state.into(),
            previous_state: None,
            state_changed_at: Utc::now(),
            context,
        }
    }

    /// Returns the store key for this record.
    pub fn store_key(&self) -> String {
        store_key(&self.machine_id, &self.entity_id)
    }

    /// Moves the record to `target` and merges the event context.
    ///
    /// Event keys overwrite context keys of the same name.
    pub(crate) fn apply_transition(&mut self, target: &str, event_context: &Context) {
        self.change_state(target);
        for (k, v) in event_context {
            self.context.insert(k.clone(), v.clone());
        }
    }

    /// Moves the record to `target` without touching the context.
    pub(crate) fn change_state(&mut self, target: &str) {
        let previous = std::mem::replace(&mut self.current_state, target.to_string());
        self.previous_state = Some(previous);
        self.state_changed_at = next_timestamp(self.state_changed_at);
    }
}

/// Returns the current time, or one microsecond past `previous` if the clock
/// has not moved beyond it.
pub(crate) fn next_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> Context {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_record_creation() {
        let record = StateRecord::new("doc", "o1", "DRAFT", ctx(json!({"owner": "ann"})));
        assert_eq!(record.machine_id, "doc");
        assert_eq!(record.entity_id, "o1");
        assert_eq!(record.current_state, "DRAFT");
        assert!(record.previous_state.is_none());
        assert_eq!(record.context["owner"], "ann");
        assert_eq!(record.store_key(), "doc:o1");
    }

    #[test]
    fn test_record_transition_merges_context() {
        let mut record = StateRecord::new(
            "doc",
            "o1",
            "REVIEW",
            ctx(json!({"score": 10, "owner": "ann"})),
        );
        let before = record.state_changed_at;

        record.apply_transition("APPROVED", &ctx(json!({"score": 80, "reviewer": "bo"})));

        assert_eq!(record.current_state, "APPROVED");
        assert_eq!(record.previous_state.as_deref(), Some("REVIEW"));
        assert!(record.state_changed_at > before);
        assert_eq!(record.context["score"], 80);
        assert_eq!(record.context["owner"], "ann");
        assert_eq!(record.context["reviewer"], "bo");
    }

    #[test]
    fn test_timestamp_strictly_increases() {
        let future = Utc::now() + Duration::seconds(60);
        let next = next_timestamp(future);
        assert_eq!(next, future + Duration::microseconds(1));
    }

    #[test]
    fn test_record_serde() {
        let record = StateRecord::new("doc", "o1", "DRAFT", ctx(json!({"n": [1, 2]})));
        let text = serde_json::to_string(&record).unwrap();
        let back: StateRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
    }
}
