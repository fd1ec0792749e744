//! # fsmkit-notify
//!
//! Change notification transports for fsmkit.
//!
//! This crate provides:
//! - [`QueuedNotifier`], a bounded drop-on-full queue with a dispatcher task
//! - [`Broadcaster`], per-entity and filtered global subscriptions

pub mod broadcast;
pub mod queue;

pub use broadcast::{create_broadcaster, Broadcaster, EventFilter, SubscriptionReceiver};
pub use queue::{spawn_dispatcher, QueuedNotifier};
