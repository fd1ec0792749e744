//! Property-based tests for the engine's transition contract.

use fsmkit_core::{
    Context, CoreError, GuardExpr, MachineDefinition, MemoryStore, Registry, StateMachineEngine,
    TransitionSpec,
};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;

const STATES: [&str; 5] = ["DRAFT", "REVIEW", "APPROVED", "REJECTED", "ARCHIVED"];
const EVENTS: [&str; 5] = ["submit", "approve", "reject", "archive", "reopen"];

fn definition() -> MachineDefinition {
    MachineDefinition::builder("doc", "DRAFT")
        .states(STATES)
        .end_states(["ARCHIVED"])
        .transition(TransitionSpec::new("DRAFT", "submit", "REVIEW"))
        .transition(
            TransitionSpec::new("REVIEW", "approve", "APPROVED")
                .with_guard_expr("context.score >= 60")
                .unwrap(),
        )
        .transition(TransitionSpec::new("REVIEW", "reject", "REJECTED"))
        .transition(TransitionSpec::new("REJECTED", "reopen", "DRAFT"))
        .transition(TransitionSpec::new("APPROVED", "archive", "ARCHIVED"))
        .transition(TransitionSpec::new("REJECTED", "archive", "ARCHIVED"))
        .build()
}

fn engine() -> StateMachineEngine {
    let registry = Arc::new(Registry::new());
    registry.register(definition()).unwrap();
    StateMachineEngine::new(registry, Arc::new(MemoryStore::new()))
}

prop_compose! {
    fn arbitrary_state()(i in 0..STATES.len()) -> &'static str {
        STATES[i]
    }
}

prop_compose! {
    fn arbitrary_event()(i in 0..EVENTS.len()) -> &'static str {
        EVENTS[i]
    }
}

fn score_context(score: i64) -> Context {
    let mut ctx = Context::new();
    ctx.insert("score".to_string(), json!(score));
    ctx
}

proptest! {
    #[test]
    fn terminal_state_rejects_every_event(event in "[a-z_]{1,12}") {
        let engine = engine();
        engine.initialize("doc", "e1", Context::new()).unwrap();
        engine.force_state("doc", "e1", "ARCHIVED").unwrap();
        let before = engine.get_state("doc", "e1").unwrap();

        let result = engine.send_event("doc", "e1", &event, Context::new());
        let is_terminal = matches!(result, Err(CoreError::TerminalState { .. }));
        prop_assert!(is_terminal);
        prop_assert_eq!(engine.get_state("doc", "e1").unwrap(), before);
    }

    #[test]
    fn available_events_match_transitions_from(state in arbitrary_state()) {
        let engine = engine();
        engine.initialize("doc", "e1", Context::new()).unwrap();
        engine.force_state("doc", "e1", state).unwrap();

        let def = definition();
        let expected: Vec<String> = def
            .transitions_from(state)
            .into_iter()
            .map(|t| t.event.clone())
            .collect();
        prop_assert_eq!(engine.available_events("doc", "e1").unwrap(), expected);
    }

    #[test]
    fn failed_guard_leaves_record_unchanged(score in -1000i64..60) {
        let engine = engine();
        engine.initialize("doc", "e1", Context::new()).unwrap();
        engine.send_event("doc", "e1", "submit", Context::new()).unwrap();
        let before = engine.get_state("doc", "e1").unwrap();

        let result = engine.send_event("doc", "e1", "approve", score_context(score));
        let rejected = matches!(result, Err(CoreError::GuardRejected { .. }));
        prop_assert!(rejected);
        prop_assert_eq!(engine.get_state("doc", "e1").unwrap(), before);
    }

    #[test]
    fn passing_guard_transitions(score in 60i64..10_000) {
        let engine = engine();
        engine.initialize("doc", "e1", Context::new()).unwrap();
        engine.send_event("doc", "e1", "submit", Context::new()).unwrap();

        let rec = engine.send_event("doc", "e1", "approve", score_context(score)).unwrap();
        prop_assert_eq!(rec.current_state.as_str(), "APPROVED");
        prop_assert_eq!(rec.context.get("score"), Some(&json!(score)));
    }

    #[test]
    fn send_event_outcome_is_consistent(
        start in arbitrary_state(),
        event in arbitrary_event(),
        score in 0i64..100,
    ) {
        let engine = engine();
        engine.initialize("doc", "e1", Context::new()).unwrap();
        let before = engine.force_state("doc", "e1", start).unwrap();

        match engine.send_event("doc", "e1", event, score_context(score)) {
            Ok(after) => {
                prop_assert_eq!(after.previous_state.as_deref(), Some(start));
                prop_assert!(after.state_changed_at > before.state_changed_at);
                prop_assert_eq!(engine.get_state("doc", "e1").unwrap(), Some(after));
            }
            Err(_) => {
                prop_assert_eq!(engine.get_state("doc", "e1").unwrap(), Some(before));
            }
        }
    }

    #[test]
    fn force_state_reaches_any_declared_state(
        start in arbitrary_state(),
        target in arbitrary_state(),
    ) {
        let engine = engine();
        engine.initialize("doc", "e1", Context::new()).unwrap();
        engine.force_state("doc", "e1", start).unwrap();

        let rec = engine.force_state("doc", "e1", target).unwrap();
        prop_assert_eq!(rec.current_state.as_str(), target);
        prop_assert_eq!(rec.previous_state.as_deref(), Some(start));
    }

    #[test]
    fn guard_parser_never_panics(input in ".{0,40}") {
        let _ = GuardExpr::parse(&input);
    }
}
