//! Broadcast hub for state change subscriptions.

use dashmap::DashMap;
use fsmkit_core::{ChangeEvent, ChangeNotifier, Context, NotifyError};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Filter for global subscriptions. Empty lists match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only changes for these machines.
    pub machines: Vec<String>,
    /// Only changes FROM these states.
    pub from_states: Vec<String>,
    /// Only changes TO these states.
    pub to_states: Vec<String>,
    /// Only changes triggered by these events.
    pub events: Vec<String>,
    /// `Some(true)` keeps only forced overrides, `Some(false)` drops them.
    pub forced: Option<bool>,
}

impl EventFilter {
    /// Returns true if the change matches this filter.
    ///
    /// A non-empty `events` list never matches a forced override.
    pub fn matches(&self, change: &ChangeEvent) -> bool {
        (self.machines.is_empty() || self.machines.contains(&change.machine_id))
            && (self.from_states.is_empty() || self.from_states.contains(&change.from_state))
            && (self.to_states.is_empty() || self.to_states.contains(&change.to_state))
            && (self.events.is_empty()
                || change
                    .event
                    .as_ref()
                    .map(|e| self.events.contains(e))
                    .unwrap_or(false))
            && self.forced.map(|f| f == change.is_forced()).unwrap_or(true)
    }
}

/// Receiving side of a subscription.
///
/// Skips changes outside the filter and strips the context when the
/// subscription did not ask for it. Dropping the receiver ends the
/// subscription.
pub struct SubscriptionReceiver {
    subscription_id: String,
    filter: Option<EventFilter>,
    include_context: bool,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl SubscriptionReceiver {
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Waits for the next matching change. Returns None once the hub is
    /// gone.
    ///
    /// A receiver that falls behind skips the changes it missed.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(change) => {
                    if let Some(change) = self.accept(change) {
                        return Some(change);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        subscription = %self.subscription_id,
                        skipped,
                        "subscriber lagged, changes dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn accept(&self, mut change: ChangeEvent) -> Option<ChangeEvent> {
        if let Some(filter) = &self.filter {
            if !filter.matches(&change) {
                return None;
            }
        }
        if !self.include_context {
            change.context = Context::new();
        }
        Some(change)
    }
}

/// Fans state changes out to per-entity and global subscribers.
pub struct Broadcaster {
    /// Per-entity broadcast channels.
    channels: DashMap<(String, String), broadcast::Sender<ChangeEvent>>,

    /// Global broadcast channel.
    global_sender: broadcast::Sender<ChangeEvent>,

    /// Channel capacity, at least 1.
    channel_capacity: usize,
}

impl Broadcaster {
    /// A zero capacity is raised to 1.
    pub fn new(channel_capacity: usize) -> Self {
        let channel_capacity = channel_capacity.max(1);
        let (global_sender, _) = broadcast::channel(channel_capacity);
        Self {
            channels: DashMap::new(),
            global_sender,
            channel_capacity,
        }
    }

    /// Subscribes to one entity's changes.
    pub fn subscribe_entity(
        &self,
        machine_id: &str,
        entity_id: &str,
        include_context: bool,
    ) -> SubscriptionReceiver {
        let rx = self
            .channels
            .entry((machine_id.to_string(), entity_id.to_string()))
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe();

        SubscriptionReceiver {
            subscription_id: new_subscription_id(),
            filter: None,
            include_context,
            rx,
        }
    }

    /// Subscribes to every change matching `filter`.
    pub fn subscribe_all(&self, filter: EventFilter, include_context: bool) -> SubscriptionReceiver {
        SubscriptionReceiver {
            subscription_id: new_subscription_id(),
            filter: Some(filter),
            include_context,
            rx: self.global_sender.subscribe(),
        }
    }

    /// Sends a change to the entity's channel and the global channel.
    pub fn notify(&self, change: ChangeEvent) {
        let key = (change.machine_id.clone(), change.entity_id.clone());
        let mut idle = false;

        if let Some(sender) = self.channels.get(&key) {
            // No receivers left is not an error.
            let _ = sender.send(change.clone());
            idle = sender.receiver_count() == 0;
        }
        if idle {
            self.channels.remove_if(&key, |_, s| s.receiver_count() == 0);
        }

        let _ = self.global_sender.send(change);
    }

    /// Live receivers across entity and global subscriptions.
    pub fn receiver_count(&self) -> usize {
        let entity: usize = self.channels.iter().map(|s| s.receiver_count()).sum();
        entity + self.global_sender.receiver_count()
    }

    /// Entities with an open channel.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

fn new_subscription_id() -> String {
    format!("sub-{}", uuid::Uuid::new_v4())
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ChangeNotifier for Broadcaster {
    fn publish(&self, event: ChangeEvent) -> Result<(), NotifyError> {
        self.notify(event);
        Ok(())
    }
}

/// Creates a shared Broadcaster.
pub fn create_broadcaster(channel_capacity: usize) -> Arc<Broadcaster> {
    Arc::new(Broadcaster::new(channel_capacity))
}
