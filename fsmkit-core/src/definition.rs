//! State machine definition types.
//!
//! Definitions are built in code with [`MachineDefinition::builder`] or
//! loaded from a declarative document:
//!
//! ```json
//! {
//!   "id": "doc",
//!   "states": ["DRAFT", "REVIEW", "APPROVED", "REJECTED"],
//!   "initial": "DRAFT",
//!   "end_states": ["APPROVED", "REJECTED"],
//!   "transitions": [
//!     {"from": "DRAFT", "event": "submit", "to": "REVIEW"},
//!     {"from": "REVIEW", "event": "approve", "to": "APPROVED", "guard": "context.score >= 60"},
//!     {"from": ["DRAFT", "REVIEW"], "event": "reject", "to": "REJECTED", "action": "archive"}
//!   ]
//! }
//! ```
//!
//! A `guard` is an expression (see [`crate::guard`]) or `@name` for a named
//! predicate; an `action` is a handler name. Both are resolved against a
//! [`HandlerTable`] when the document is loaded.

use crate::action::{Action, HandlerTable};
use crate::error::CoreError;
use crate::guard::{Guard, GuardEvaluator};
use crate::record::{Context, StateRecord, STORE_KEY_SEPARATOR};
use serde::{Deserialize, Serialize};

/// One `(source, event) -> target` rule.
#[derive(Debug, Clone)]
pub struct TransitionSpec {
    pub event: String,
    pub source: String,
    pub target: String,
    pub guard: Option<Guard>,
    pub action: Option<Action>,
    pub description: Option<String>,
}

impl TransitionSpec {
    pub fn new(
        source: impl Into<String>,
        event: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            event: event.into(),
            source: source.into(),
            target: target.into(),
            guard: None,
            action: None,
            description: None,
        }
    }

    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Parses and attaches an expression guard.
    pub fn with_guard_expr(self, expr: &str) -> Result<Self, CoreError> {
        Ok(self.with_guard(Guard::expr(expr)?))
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Raw transition as written in a definition document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRaw {
    /// Source state(s). Can be a single state or multiple.
    #[serde(deserialize_with = "deserialize_from_states")]
    pub from: Vec<String>,

    /// Event that triggers this transition.
    pub event: String,

    /// Target state.
    pub to: String,

    /// Guard expression, or `@name` for a named predicate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,

    /// Named action handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn deserialize_from_states<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct FromStatesVisitor;

    impl<'de> Visitor<'de> for FromStatesVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut states = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                states.push(s);
            }
            Ok(states)
        }
    }

    deserializer.deserialize_any(FromStatesVisitor)
}

/// Raw machine definition as stored/transmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineDefinitionRaw {
    /// Machine id.
    pub id: String,

    /// All valid states.
    pub states: Vec<String>,

    /// Initial state for new records.
    pub initial: String,

    /// Terminal states.
    #[serde(default)]
    pub end_states: Vec<String>,

    /// Transitions, in resolution order.
    #[serde(default)]
    pub transitions: Vec<TransitionRaw>,

    /// Optional metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// An immutable machine definition.
#[derive(Debug, Clone)]
pub struct MachineDefinition {
    id: String,
    initial_state: String,
    states: Vec<String>,
    end_states: Vec<String>,
    transitions: Vec<TransitionSpec>,
    meta: Option<serde_json::Value>,
}

impl MachineDefinition {
    /// Starts building a definition in code.
    pub fn builder(id: impl Into<String>, initial_state: impl Into<String>) -> DefinitionBuilder {
        DefinitionBuilder {
            definition: MachineDefinition {
                id: id.into(),
                initial_state: initial_state.into(),
                states: Vec::new(),
                end_states: Vec::new(),
                transitions: Vec::new(),
                meta: None,
            },
        }
    }

    /// Parses and validates a definition document.
    pub fn from_json(json: &serde_json::Value, handlers: &HandlerTable) -> Result<Self, CoreError> {
        let raw: MachineDefinitionRaw = serde_json::from_value(json.clone())
            .map_err(|e| CoreError::invalid_definition(e.to_string()))?;
        Self::from_raw(raw, handlers)
    }

    /// Parses and validates a YAML definition document.
    pub fn from_yaml(yaml: &str, handlers: &HandlerTable) -> Result<Self, CoreError> {
        let raw: MachineDefinitionRaw = serde_yaml::from_str(yaml)
            .map_err(|e| CoreError::invalid_definition(e.to_string()))?;
        Self::from_raw(raw, handlers)
    }

    /// Builds a definition from a raw document, resolving named handlers.
    pub fn from_raw(raw: MachineDefinitionRaw, handlers: &HandlerTable) -> Result<Self, CoreError> {
        let mut builder = Self::builder(raw.id, raw.initial)
            .states(raw.states)
            .end_states(raw.end_states);

        for t in raw.transitions {
            if t.from.is_empty() {
                return Err(CoreError::invalid_definition(format!(
                    "transition on event '{}' has no source state",
                    t.event
                )));
            }

            let guard = match t.guard.as_deref().map(str::trim) {
                None => None,
                Some(name) if name.starts_with('@') => {
                    let guard = handlers.guard(&name[1..]).ok_or_else(|| {
                        CoreError::invalid_definition(format!("unknown guard '{}'", name))
                    })?;
                    Some(guard.clone())
                }
                Some(expr) => Some(Guard::expr(expr)?),
            };

            let action = match &t.action {
                None => None,
                Some(name) => Some(
                    handlers
                        .action(name)
                        .cloned()
                        .ok_or_else(|| {
                            CoreError::invalid_definition(format!("unknown action '{}'", name))
                        })?,
                ),
            };

            // One transition per source state, in document order.
            for from in t.from {
                builder = builder.transition(TransitionSpec {
                    event: t.event.clone(),
                    source: from,
                    target: t.to.clone(),
                    guard: guard.clone(),
                    action: action.clone(),
                    description: t.description.clone(),
                });
            }
        }

        let mut definition = builder.build();
        definition.meta = raw.meta;
        definition.validate()?;
        Ok(definition)
    }

    /// Renders the definition back to document form.
    ///
    /// Closure guards render as `@name`; multi-source transitions come back
    /// as one entry per source.
    pub fn to_raw(&self) -> MachineDefinitionRaw {
        MachineDefinitionRaw {
            id: self.id.clone(),
            states: self.states.clone(),
            initial: self.initial_state.clone(),
            end_states: self.end_states.clone(),
            transitions: self
                .transitions
                .iter()
                .map(|t| TransitionRaw {
                    from: vec![t.source.clone()],
                    event: t.event.clone(),
                    to: t.target.clone(),
                    guard: t.guard.as_ref().map(Guard::describe),
                    action: t.action.as_ref().map(|a| a.name().to_string()),
                    description: t.description.clone(),
                })
                .collect(),
            meta: self.meta.clone(),
        }
    }

    /// Checks the structural invariants: the initial state, every end state
    /// and every transition endpoint must be declared states.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.id.is_empty() {
            return Err(CoreError::invalid_definition("machine id is empty"));
        }
        if self.id.contains(STORE_KEY_SEPARATOR) {
            return Err(CoreError::invalid_definition(format!(
                "machine id '{}' must not contain '{}'",
                self.id, STORE_KEY_SEPARATOR
            )));
        }

        if !self.is_valid_state(&self.initial_state) {
            return Err(CoreError::invalid_definition(format!(
                "initial state '{}' not in states list",
                self.initial_state
            )));
        }

        if let Some(end) = self.end_states.iter().find(|s| !self.is_valid_state(s)) {
            return Err(CoreError::invalid_definition(format!(
                "end state '{}' not in states list",
                end
            )));
        }

        for t in &self.transitions {
            if t.event.is_empty() {
                return Err(CoreError::invalid_definition(format!(
                    "transition from '{}' has an empty event name",
                    t.source
                )));
            }
            if !self.is_valid_state(&t.source) {
                return Err(CoreError::invalid_definition(format!(
                    "transition source '{}' not in states list",
                    t.source
                )));
            }
            if !self.is_valid_state(&t.target) {
                return Err(CoreError::invalid_definition(format!(
                    "transition target '{}' not in states list",
                    t.target
                )));
            }
        }

        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    pub fn states(&self) -> &[String] {
        &self.states
    }

    pub fn end_states(&self) -> &[String] {
        &self.end_states
    }

    pub fn transitions(&self) -> &[TransitionSpec] {
        &self.transitions
    }

    pub fn meta(&self) -> Option<&serde_json::Value> {
        self.meta.as_ref()
    }

    /// Resolves the transition for `event` in `current_state`.
    ///
    /// Candidates are tried in registration order and the first whose guard
    /// passes wins.
    pub fn find_transition(
        &self,
        current_state: &str,
        event: &str,
        record: &StateRecord,
        event_context: &Context,
    ) -> Result<&TransitionSpec, CoreError> {
        let mut matched = false;

        for t in self
            .transitions
            .iter()
            .filter(|t| t.source == current_state && t.event == event)
        {
            matched = true;
            if GuardEvaluator::evaluate(t.guard.as_ref(), record, event_context) {
                return Ok(t);
            }
        }

        if matched {
            Err(CoreError::GuardRejected {
                state: current_state.to_string(),
                event: event.to_string(),
            })
        } else {
            Err(CoreError::NoApplicableTransition {
                state: current_state.to_string(),
                event: event.to_string(),
            })
        }
    }

    pub fn is_end_state(&self, state: &str) -> bool {
        self.end_states.iter().any(|s| s == state)
    }

    pub fn is_valid_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }

    /// Returns every transition leaving `state`, regardless of guards.
    pub fn transitions_from(&self, state: &str) -> Vec<&TransitionSpec> {
        self.transitions
            .iter()
            .filter(|t| t.source == state)
            .collect()
    }

    /// Returns the distinct event names leaving `state`, in declaration order.
    pub fn events_from(&self, state: &str) -> Vec<&str> {
        let mut events: Vec<&str> = Vec::new();
        for t in self.transitions_from(state) {
            if !events.contains(&t.event.as_str()) {
                events.push(&t.event);
            }
        }
        events
    }
}

/// Builder for [`MachineDefinition`].
///
/// Building does not validate; [`Registry::register`](crate::Registry::register)
/// does.
#[derive(Debug)]
pub struct DefinitionBuilder {
    definition: MachineDefinition,
}

impl DefinitionBuilder {
    pub fn state(mut self, state: impl Into<String>) -> Self {
        let state = state.into();
        if !self.definition.states.contains(&state) {
            self.definition.states.push(state);
        }
        self
    }

    pub fn states<I, S>(self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        states.into_iter().fold(self, |b, s| b.state(s))
    }

    pub fn end_state(mut self, state: impl Into<String>) -> Self {
        let state = state.into();
        if !self.definition.end_states.contains(&state) {
            self.definition.end_states.push(state);
        }
        self
    }

    pub fn end_states<I, S>(self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        states.into_iter().fold(self, |b, s| b.end_state(s))
    }

    pub fn transition(mut self, transition: TransitionSpec) -> Self {
        self.definition.transitions.push(transition);
        self
    }

    pub fn meta(mut self, meta: serde_json::Value) -> Self {
        self.definition.meta = Some(meta);
        self
    }

    pub fn build(self) -> MachineDefinition {
        self.definition
    }
}
