//! State machine engine - coordinates the registry, the store, guards,
//! actions and change notification.

use crate::action::{ActionContext, ActionExecutor};
use crate::definition::MachineDefinition;
use crate::error::CoreError;
use crate::lock::{KeyLocks, LockingMode};
use crate::notify::{ChangeEvent, ChangeNotifier, NoopNotifier};
use crate::record::{Context, StateRecord};
use crate::registry::Registry;
use crate::store::StateStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Engine tuning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub locking: LockingMode,
}

/// The state machine engine.
///
/// Holds no record state of its own: every operation re-reads the record
/// from the store.
pub struct StateMachineEngine {
    registry: Arc<Registry>,
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn ChangeNotifier>,
    locks: KeyLocks,
}

impl StateMachineEngine {
    /// Creates an engine with per-key locking and no notifier.
    pub fn new(registry: Arc<Registry>, store: Arc<dyn StateStore>) -> Self {
        Self {
            registry,
            store,
            notifier: Arc::new(NoopNotifier),
            locks: KeyLocks::new(LockingMode::default()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.locks = KeyLocks::new(options.locking);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Creates the record for an entity in the machine's initial state.
    ///
    /// Fails with `AlreadyInitialized` if the entity already has a record.
    pub fn initialize(
        &self,
        machine_id: &str,
        entity_id: &str,
        initial_context: Context,
    ) -> Result<StateRecord, CoreError> {
        self.init_record(machine_id, entity_id, initial_context, false)
    }

    /// Like [`initialize`](Self::initialize), but replaces an existing record.
    pub fn reinitialize(
        &self,
        machine_id: &str,
        entity_id: &str,
        initial_context: Context,
    ) -> Result<StateRecord, CoreError> {
        self.init_record(machine_id, entity_id, initial_context, true)
    }

    fn init_record(
        &self,
        machine_id: &str,
        entity_id: &str,
        initial_context: Context,
        overwrite: bool,
    ) -> Result<StateRecord, CoreError> {
        let definition = self.registry.require(machine_id)?;

        let record = self.locks.with_key(machine_id, entity_id, || -> Result<_, CoreError> {
            if !overwrite && self.store.exists(machine_id, entity_id)? {
                return Err(CoreError::AlreadyInitialized {
                    machine: machine_id.to_string(),
                    entity: entity_id.to_string(),
                });
            }

            let record = StateRecord::new(
                machine_id,
                entity_id,
                definition.initial_state(),
                initial_context,
            );
            self.store.save(&record)?;
            Ok(record)
        })?;

        tracing::info!(
            machine = machine_id,
            entity = entity_id,
            state = %record.current_state,
            reinitialized = overwrite,
            "initialized state record"
        );

        Ok(record)
    }

    /// Applies an event to an entity and returns the updated record.
    ///
    /// A failed call leaves the stored record unchanged. The change is
    /// published after the key lock is released, so observers may call back
    /// into the engine.
    pub fn send_event(
        &self,
        machine_id: &str,
        entity_id: &str,
        event: &str,
        event_context: Context,
    ) -> Result<StateRecord, CoreError> {
        let definition = self.registry.require(machine_id)?;

        let (record, from_state) = self.locks.with_key(machine_id, entity_id, || -> Result<_, CoreError> {
            let mut record = self.load(machine_id, entity_id)?;
            self.check_not_terminal(&definition, &record)?;

            let transition = definition.find_transition(
                &record.current_state,
                event,
                &record,
                &event_context,
            )?;

            let from_state = record.current_state.clone();

            // Actions write into a copy; it becomes the record context only
            // if the action succeeds.
            let mut context = record.context.clone();
            let mut action_ctx = ActionContext {
                machine_id,
                entity_id,
                from_state: &from_state,
                to_state: &transition.target,
                event,
                event_context: &event_context,
                context: &mut context,
            };
            ActionExecutor::execute(transition.action.as_ref(), &mut action_ctx).map_err(
                |source| CoreError::ActionFailed {
                    event: event.to_string(),
                    source,
                },
            )?;

            record.context = context;
            record.apply_transition(&transition.target, &event_context);
            self.store.save(&record)?;
            Ok((record, from_state))
        })?;

        tracing::debug!(
            machine = machine_id,
            entity = entity_id,
            event,
            "transition '{}' -> '{}'",
            from_state,
            record.current_state
        );

        self.publish(&record, from_state, Some(event));
        Ok(record)
    }

    /// Moves an entity to any declared state, bypassing guards and actions.
    pub fn force_state(
        &self,
        machine_id: &str,
        entity_id: &str,
        new_state: &str,
    ) -> Result<StateRecord, CoreError> {
        let definition = self.registry.require(machine_id)?;

        if !definition.is_valid_state(new_state) {
            return Err(CoreError::InvalidState {
                machine: machine_id.to_string(),
                state: new_state.to_string(),
            });
        }

        let (record, from_state) = self.locks.with_key(machine_id, entity_id, || -> Result<_, CoreError> {
            let mut record = self.load(machine_id, entity_id)?;
            let from_state = record.current_state.clone();

            record.change_state(new_state);
            self.store.save(&record)?;
            Ok((record, from_state))
        })?;

        tracing::info!(
            machine = machine_id,
            entity = entity_id,
            "forced state '{}' -> '{}'",
            from_state,
            new_state
        );

        self.publish(&record, from_state, None);
        Ok(record)
    }

    /// Deletes an entity's record. Returns whether one existed.
    pub fn remove_state(&self, machine_id: &str, entity_id: &str) -> Result<bool, CoreError> {
        let removed = self
            .locks
            .with_key(machine_id, entity_id, || self.store.remove(machine_id, entity_id))?;
        Ok(removed)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_state(
        &self,
        machine_id: &str,
        entity_id: &str,
    ) -> Result<Option<StateRecord>, CoreError> {
        Ok(self.store.find(machine_id, entity_id)?)
    }

    pub fn get_current_state(
        &self,
        machine_id: &str,
        entity_id: &str,
    ) -> Result<Option<String>, CoreError> {
        Ok(self.get_state(machine_id, entity_id)?.map(|r| r.current_state))
    }

    pub fn has_state(&self, machine_id: &str, entity_id: &str) -> Result<bool, CoreError> {
        Ok(self.store.exists(machine_id, entity_id)?)
    }

    /// Entity ids with a stored record for `machine_id`.
    pub fn list_entities(&self, machine_id: &str) -> Result<Vec<String>, CoreError> {
        Ok(self.store.entities(machine_id)?)
    }

    /// Events leaving the entity's current state, without evaluating guards.
    pub fn available_events(
        &self,
        machine_id: &str,
        entity_id: &str,
    ) -> Result<Vec<String>, CoreError> {
        let definition = self.registry.require(machine_id)?;
        let record = self.load(machine_id, entity_id)?;

        Ok(definition
            .events_from(&record.current_state)
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    /// Advisory probe: would `event` resolve with an empty event context?
    ///
    /// Any error reads as `false`. A later `send_event` carrying a payload
    /// may still be rejected or accepted differently.
    pub fn can_send_event(&self, machine_id: &str, entity_id: &str, event: &str) -> bool {
        let probe = || -> Result<(), CoreError> {
            let definition = self.registry.require(machine_id)?;
            let record = self.load(machine_id, entity_id)?;
            self.check_not_terminal(&definition, &record)?;
            definition.find_transition(&record.current_state, event, &record, &Context::new())?;
            Ok(())
        };

        match probe() {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(machine = machine_id, entity = entity_id, event, "probe failed: {}", e);
                false
            }
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn load(&self, machine_id: &str, entity_id: &str) -> Result<StateRecord, CoreError> {
        self.store
            .find(machine_id, entity_id)?
            .ok_or_else(|| CoreError::StateNotFound {
                machine: machine_id.to_string(),
                entity: entity_id.to_string(),
            })
    }

    fn check_not_terminal(
        &self,
        definition: &MachineDefinition,
        record: &StateRecord,
    ) -> Result<(), CoreError> {
        if definition.is_end_state(&record.current_state) {
            return Err(CoreError::TerminalState {
                machine: record.machine_id.clone(),
                entity: record.entity_id.clone(),
                state: record.current_state.clone(),
            });
        }
        Ok(())
    }

    fn publish(&self, record: &StateRecord, from_state: String, event: Option<&str>) {
        let change = ChangeEvent {
            machine_id: record.machine_id.clone(),
            entity_id: record.entity_id.clone(),
            from_state,
            to_state: record.current_state.clone(),
            event: event.map(str::to_string),
            context: record.context.clone(),
            changed_at: record.state_changed_at,
        };

        if let Err(e) = self.notifier.publish(change) {
            tracing::warn!(
                machine = %record.machine_id,
                entity = %record.entity_id,
                "failed to publish state change: {}",
                e
            );
        }
    }
}

impl std::fmt::Debug for StateMachineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineEngine")
            .field("machines", &self.registry.len())
            .field("locking", &self.locks)
            .field("lock_slots", &self.locks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::definition::TransitionSpec;
    use crate::error::{ActionError, StoreError};
    use crate::notify::{NotifyError, ObserverList};
    use crate::store::MemoryStore;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx(value: Value) -> Context {
        value.as_object().cloned().unwrap_or_default()
    }

    fn doc_definition() -> MachineDefinition {
        MachineDefinition::builder("doc", "DRAFT")
            .states(["DRAFT", "REVIEW", "APPROVED", "REJECTED"])
            .end_states(["APPROVED", "REJECTED"])
            .transition(TransitionSpec::new("DRAFT", "submit", "REVIEW"))
            .transition(
                TransitionSpec::new("REVIEW", "approve", "APPROVED")
                    .with_guard_expr("context.score >= 60")
                    .unwrap(),
            )
            .transition(TransitionSpec::new("REVIEW", "reject", "REJECTED"))
            .build()
    }

    fn engine_with(definition: MachineDefinition) -> StateMachineEngine {
        let registry = Arc::new(Registry::new());
        registry.register(definition).unwrap();
        StateMachineEngine::new(registry, Arc::new(MemoryStore::new()))
    }

    fn test_engine() -> StateMachineEngine {
        engine_with(doc_definition())
    }

    #[test]
    fn test_document_lifecycle() {
        let engine = test_engine();

        let rec = engine.initialize("doc", "o1", Context::new()).unwrap();
        assert_eq!(rec.current_state, "DRAFT");
        assert!(rec.previous_state.is_none());

        let rec = engine.send_event("doc", "o1", "submit", Context::new()).unwrap();
        assert_eq!(rec.current_state, "REVIEW");
        assert_eq!(rec.previous_state.as_deref(), Some("DRAFT"));

        let err = engine
            .send_event("doc", "o1", "approve", ctx(json!({"score": 40})))
            .unwrap_err();
        assert!(matches!(err, CoreError::GuardRejected { .. }));
        assert_eq!(
            engine.get_current_state("doc", "o1").unwrap().as_deref(),
            Some("REVIEW")
        );

        let rec = engine.send_event("doc", "o1", "reject", Context::new()).unwrap();
        assert_eq!(rec.current_state, "REJECTED");

        let err = engine
            .send_event("doc", "o1", "submit", Context::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::TerminalState { .. }));
    }

    #[test]
    fn test_guard_sees_event_context() {
        let engine = test_engine();
        engine.initialize("doc", "o1", Context::new()).unwrap();
        engine.send_event("doc", "o1", "submit", Context::new()).unwrap();

        let rec = engine
            .send_event("doc", "o1", "approve", ctx(json!({"score": 80})))
            .unwrap();
        assert_eq!(rec.current_state, "APPROVED");
        assert_eq!(rec.context["score"], 80);
    }

    #[test]
    fn test_unknown_machine_and_entity() {
        let engine = test_engine();

        let err = engine.initialize("nope", "o1", Context::new()).unwrap_err();
        assert!(matches!(err, CoreError::MachineNotFound { .. }));

        let err = engine
            .send_event("doc", "ghost", "submit", Context::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::StateNotFound { .. }));

        let err = engine
            .send_event("nope", "o1", "submit", Context::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::MachineNotFound { .. }));
    }

    #[test]
    fn test_no_applicable_transition() {
        let engine = test_engine();
        engine.initialize("doc", "o1", Context::new()).unwrap();

        let err = engine
            .send_event("doc", "o1", "approve", Context::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::NoApplicableTransition { .. }));
    }

    #[test]
    fn test_initialize_twice() {
        let engine = test_engine();
        engine
            .initialize("doc", "o1", ctx(json!({"owner": "ann"})))
            .unwrap();
        engine.send_event("doc", "o1", "submit", Context::new()).unwrap();

        let err = engine.initialize("doc", "o1", Context::new()).unwrap_err();
        assert!(matches!(err, CoreError::AlreadyInitialized { .. }));
        assert_eq!(
            engine.get_current_state("doc", "o1").unwrap().as_deref(),
            Some("REVIEW")
        );

        let rec = engine.reinitialize("doc", "o1", Context::new()).unwrap();
        assert_eq!(rec.current_state, "DRAFT");
        assert!(rec.context.is_empty());
    }

    #[test]
    fn test_initialize_copies_context() {
        let engine = test_engine();
        let initial = ctx(json!({"owner": "ann"}));
        let rec = engine.initialize("doc", "o1", initial.clone()).unwrap();
        assert_eq!(rec.context, initial);
        assert_eq!(engine.get_state("doc", "o1").unwrap().unwrap(), rec);
    }

    #[test]
    fn test_action_failure_leaves_record_unchanged() {
        let definition = MachineDefinition::builder("pay", "pending")
            .states(["pending", "paid"])
            .transition(
                TransitionSpec::new("pending", "charge", "paid").with_action(Action::new(
                    "charge_card",
                    |ctx| {
                        ctx.context.insert("attempted".into(), json!(true));
                        Err(ActionError::new("card declined"))
                    },
                )),
            )
            .build();
        let engine = engine_with(definition);
        let before = engine
            .initialize("pay", "p1", ctx(json!({"amount": 10})))
            .unwrap();

        let err = engine
            .send_event("pay", "p1", "charge", ctx(json!({"card": "x"})))
            .unwrap_err();
        assert!(matches!(err, CoreError::ActionFailed { .. }));
        assert_eq!(err.error_code(), "ACTION_FAILED");
        assert_eq!(engine.get_state("pay", "p1").unwrap().unwrap(), before);
    }

    #[test]
    fn test_action_writes_are_persisted() {
        let definition = MachineDefinition::builder("pay", "pending")
            .states(["pending", "paid"])
            .transition(
                TransitionSpec::new("pending", "charge", "paid").with_action(Action::new(
                    "receipt",
                    |ctx| {
                        let amount = ctx.context.get("amount").cloned().unwrap_or_default();
                        ctx.context.insert("receipt_amount".into(), amount);
                        ctx.context.insert("card".into(), json!("action"));
                        Ok(())
                    },
                )),
            )
            .build();
        let engine = engine_with(definition);
        engine
            .initialize("pay", "p1", ctx(json!({"amount": 10})))
            .unwrap();

        let rec = engine
            .send_event("pay", "p1", "charge", ctx(json!({"card": "visa"})))
            .unwrap();
        assert_eq!(rec.context["receipt_amount"], 10);
        // Event keys are merged after the action ran.
        assert_eq!(rec.context["card"], "visa");
    }

    #[test]
    fn test_force_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let definition = MachineDefinition::builder("doc", "DRAFT")
            .states(["DRAFT", "REVIEW", "APPROVED"])
            .end_state("APPROVED")
            .transition(
                TransitionSpec::new("DRAFT", "submit", "REVIEW")
                    .with_guard(crate::guard::Guard::predicate("count", move |_| {
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok(true)
                    }))
                    .with_action(Action::new("never", |_| Err(ActionError::new("ran")))),
            )
            .build();
        let engine = engine_with(definition);
        engine.initialize("doc", "o1", Context::new()).unwrap();

        let rec = engine.force_state("doc", "o1", "APPROVED").unwrap();
        assert_eq!(rec.previous_state.as_deref(), Some("DRAFT"));
        assert_eq!(rec.current_state, "APPROVED");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let err = engine.force_state("doc", "o1", "LIMBO").unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));

        let err = engine.force_state("doc", "ghost", "DRAFT").unwrap_err();
        assert!(matches!(err, CoreError::StateNotFound { .. }));

        // Forcing out of a terminal state is allowed.
        let rec = engine.force_state("doc", "o1", "DRAFT").unwrap();
        assert_eq!(rec.current_state, "DRAFT");
    }

    #[test]
    fn test_available_events_and_can_send() {
        let engine = test_engine();
        engine.initialize("doc", "o1", Context::new()).unwrap();
        engine.send_event("doc", "o1", "submit", Context::new()).unwrap();

        assert_eq!(
            engine.available_events("doc", "o1").unwrap(),
            vec!["approve", "reject"]
        );

        assert!(engine.can_send_event("doc", "o1", "reject"));
        // Guard needs a score that only an event payload could supply.
        assert!(!engine.can_send_event("doc", "o1", "approve"));
        assert!(!engine.can_send_event("doc", "o1", "submit"));
        assert!(!engine.can_send_event("doc", "ghost", "reject"));
        assert!(!engine.can_send_event("nope", "o1", "reject"));

        engine.send_event("doc", "o1", "reject", Context::new()).unwrap();
        assert!(engine.available_events("doc", "o1").unwrap().is_empty());
    }

    #[test]
    fn test_can_send_uses_stored_context() {
        let engine = test_engine();
        engine
            .initialize("doc", "o1", ctx(json!({"score": 75})))
            .unwrap();
        engine.send_event("doc", "o1", "submit", Context::new()).unwrap();
        assert!(engine.can_send_event("doc", "o1", "approve"));
    }

    #[test]
    fn test_remove_and_list() {
        let engine = test_engine();
        engine.initialize("doc", "b", Context::new()).unwrap();
        engine.initialize("doc", "a", Context::new()).unwrap();

        assert_eq!(engine.list_entities("doc").unwrap(), vec!["a", "b"]);
        assert!(engine.has_state("doc", "a").unwrap());
        assert!(engine.remove_state("doc", "a").unwrap());
        assert!(!engine.remove_state("doc", "a").unwrap());
        assert!(!engine.has_state("doc", "a").unwrap());
        assert!(engine.get_state("doc", "a").unwrap().is_none());
    }

    #[test]
    fn test_notifications() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observers = Arc::new(ObserverList::new());
        let s = seen.clone();
        observers.subscribe(move |change| {
            s.lock().push(change.clone());
            Ok(())
        });

        let engine = test_engine().with_notifier(observers);
        engine.initialize("doc", "o1", Context::new()).unwrap();
        engine.send_event("doc", "o1", "submit", Context::new()).unwrap();
        let _ = engine.send_event("doc", "o1", "approve", Context::new());
        engine.force_state("doc", "o1", "DRAFT").unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].from_state, "DRAFT");
        assert_eq!(seen[0].to_state, "REVIEW");
        assert_eq!(seen[0].event.as_deref(), Some("submit"));
        assert!(seen[1].is_forced());
        assert_eq!(seen[1].to_state, "DRAFT");
    }

    #[test]
    fn test_notifier_failure_does_not_fail_transition() {
        let observers = Arc::new(ObserverList::new());
        observers.subscribe(|_| Err(NotifyError::Closed));

        let engine = test_engine().with_notifier(observers);
        engine.initialize("doc", "o1", Context::new()).unwrap();
        let rec = engine.send_event("doc", "o1", "submit", Context::new()).unwrap();
        assert_eq!(rec.current_state, "REVIEW");
    }

    #[test]
    fn test_observer_can_reenter_engine() {
        let observers = Arc::new(ObserverList::new());
        let engine = Arc::new(test_engine().with_notifier(observers.clone()));

        // Reviewing automatically rejects, from inside the notification.
        let weak = Arc::downgrade(&engine);
        observers.subscribe(move |change| {
            if change.to_state != "REVIEW" {
                return Ok(());
            }
            let engine = weak
                .upgrade()
                .ok_or_else(|| NotifyError::Subscriber("engine dropped".into()))?;
            engine
                .send_event(&change.machine_id, &change.entity_id, "reject", Context::new())
                .map(|_| ())
                .map_err(|e| NotifyError::Subscriber(e.to_string()))
        });
        engine.initialize("doc", "o1", Context::new()).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = engine.clone();
        std::thread::spawn(move || {
            let _ = tx.send(worker.send_event("doc", "o1", "submit", Context::new()));
        });

        let outer = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("send_event blocked on its own notification");
        assert_eq!(outer.unwrap().current_state, "REVIEW");
        assert_eq!(engine.get_current_state("doc", "o1").unwrap().as_deref(), Some("REJECTED"));

        // Forced changes publish outside the lock too.
        engine.force_state("doc", "o1", "REVIEW").unwrap();
        assert_eq!(engine.get_current_state("doc", "o1").unwrap().as_deref(), Some("REJECTED"));
    }

    #[test]
    fn test_panicking_observer_does_not_fail_transition() {
        let observers = Arc::new(ObserverList::new());
        observers.subscribe(|_| panic!("observer bug"));

        let engine = test_engine().with_notifier(observers);
        engine.initialize("doc", "o1", Context::new()).unwrap();
        let rec = engine.send_event("doc", "o1", "submit", Context::new()).unwrap();
        assert_eq!(rec.current_state, "REVIEW");
        assert_eq!(engine.get_current_state("doc", "o1").unwrap().as_deref(), Some("REVIEW"));
    }

    #[test]
    fn test_lock_slots_released() {
        let engine = test_engine();
        for i in 0..500 {
            let entity = format!("e-{}", i);
            engine.initialize("doc", &entity, Context::new()).unwrap();
            engine.send_event("doc", &entity, "submit", Context::new()).unwrap();
            let _ = engine.send_event("doc", &entity, "approve", Context::new());
            engine.remove_state("doc", &entity).unwrap();
        }
        assert_eq!(engine.locks.len(), 0);
    }

    struct FailingStore {
        inner: MemoryStore,
        fail_saves: AtomicUsize,
    }

    impl StateStore for FailingStore {
        fn save(&self, record: &StateRecord) -> Result<(), StoreError> {
            if self.fail_saves.load(Ordering::SeqCst) > 0 {
                self.fail_saves.fetch_sub(1, Ordering::SeqCst);
                let err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
                return Err(StoreError::backend(err));
            }
            self.inner.save(record)
        }

        fn find(&self, m: &str, e: &str) -> Result<Option<StateRecord>, StoreError> {
            self.inner.find(m, e)
        }

        fn remove(&self, m: &str, e: &str) -> Result<bool, StoreError> {
            self.inner.remove(m, e)
        }

        fn entities(&self, m: &str) -> Result<Vec<String>, StoreError> {
            self.inner.entities(m)
        }
    }

    #[test]
    fn test_persistence_failure() {
        let store = Arc::new(FailingStore {
            inner: MemoryStore::new(),
            fail_saves: AtomicUsize::new(0),
        });
        let registry = Arc::new(Registry::new());
        registry.register(doc_definition()).unwrap();
        let engine = StateMachineEngine::new(registry, store.clone());

        let before = engine.initialize("doc", "o1", Context::new()).unwrap();
        store.fail_saves.store(1, Ordering::SeqCst);

        let err = engine
            .send_event("doc", "o1", "submit", Context::new())
            .unwrap_err();
        assert_eq!(err.error_code(), "PERSISTENCE_ERROR");
        assert_eq!(engine.get_state("doc", "o1").unwrap().unwrap(), before);

        // Retry succeeds once the store recovers.
        let rec = engine.send_event("doc", "o1", "submit", Context::new()).unwrap();
        assert_eq!(rec.current_state, "REVIEW");
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let definition = MachineDefinition::builder("toggle", "off")
            .states(["off", "on"])
            .transition(TransitionSpec::new("off", "flip", "on"))
            .transition(TransitionSpec::new("on", "flip", "off"))
            .build();
        let engine = engine_with(definition);
        let mut last = engine
            .initialize("toggle", "t1", Context::new())
            .unwrap()
            .state_changed_at;

        for _ in 0..50 {
            let rec = engine.send_event("toggle", "t1", "flip", Context::new()).unwrap();
            assert!(rec.state_changed_at > last);
            last = rec.state_changed_at;
        }
    }

    fn concurrent_approvals(locking: LockingMode) -> (StateRecord, usize) {
        let engine = test_engine().with_options(EngineOptions { locking });
        engine.initialize("doc", "o2", Context::new()).unwrap();
        engine.send_event("doc", "o2", "submit", Context::new()).unwrap();

        let results: Vec<Result<StateRecord, CoreError>> = std::thread::scope(|s| {
            let handles: Vec<_> = ["alice", "bob"]
                .into_iter()
                .map(|who| {
                    let engine = &engine;
                    s.spawn(move || {
                        let mut payload = ctx(json!({"score": 80}));
                        payload.insert(who.to_string(), json!(true));
                        engine.send_event("doc", "o2", "approve", payload)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let ok = results.iter().filter(|r| r.is_ok()).count();
        for r in &results {
            if let Err(e) = r {
                assert!(matches!(e, CoreError::TerminalState { .. }), "{}", e);
            }
        }
        (engine.get_state("doc", "o2").unwrap().unwrap(), ok)
    }

    #[test]
    fn test_concurrent_events_without_locking() {
        let (record, ok) = concurrent_approvals(LockingMode::None);
        assert!(ok >= 1);
        assert_eq!(record.current_state, "APPROVED");
        assert!(record.context.contains_key("alice") || record.context.contains_key("bob"));
    }

    #[test]
    fn test_concurrent_events_with_locking() {
        let (record, ok) = concurrent_approvals(LockingMode::PerKey);
        // The second writer sees the terminal state written by the first.
        assert_eq!(ok, 1);
        assert_eq!(record.current_state, "APPROVED");
        assert_eq!(record.previous_state.as_deref(), Some("REVIEW"));
    }
}
