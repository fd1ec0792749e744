//! Bounded queue between the engine and a slow notification transport.

use fsmkit_core::{ChangeEvent, ChangeNotifier, NotifyError};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

/// Hands changes to a bounded channel without ever blocking the publisher.
///
/// When the channel is full the change is dropped and counted.
#[derive(Debug, Clone)]
pub struct QueuedNotifier {
    tx: mpsc::Sender<ChangeEvent>,
    dropped: Arc<AtomicU64>,
}

impl QueuedNotifier {
    /// Creates the notifier and the receiver its dispatcher drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ChangeEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Number of changes dropped since creation.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shared drop counter, for monitoring.
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    /// True once the receiver is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl ChangeNotifier for QueuedNotifier {
    fn publish(&self, event: ChangeEvent) -> Result<(), NotifyError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(NotifyError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(NotifyError::Closed)
            }
        }
    }
}

/// Drains `rx` into `handler` until every sender is dropped.
///
/// Handler failures are logged and do not stop the loop. The task resolves
/// to the number of changes handled successfully.
pub fn spawn_dispatcher<F, Fut>(mut rx: mpsc::Receiver<ChangeEvent>, handler: F) -> JoinHandle<u64>
where
    F: Fn(ChangeEvent) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), NotifyError>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut delivered = 0u64;
        while let Some(change) = rx.recv().await {
            let machine = change.machine_id.clone();
            let entity = change.entity_id.clone();
            match handler(change).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(machine = %machine, entity = %entity, "change handler failed: {}", e);
                }
            }
        }
        tracing::debug!(delivered, "notification dispatcher stopped");
        delivered
    })
}
