// THEORY:
// The `ProgressBus` carries human-readable progress from running pipelines to
// whoever happens to be watching. It outlives every run and every observer: runs
// publish into it, observers join and leave it, and neither side knows about the
// other.
//
// Key architectural principles:
// 1.  **Registry, Not Broadcast**: Each observer owns a small bounded channel and
//     the bus keeps the sending halves in one mutex-guarded map. This lets the bus
//     tell exactly which observer failed and drop only that one.
// 2.  **Never Block the Publisher**: Delivery uses `try_send`. An observer whose
//     buffer is full (too slow) or whose receiver is gone (disconnected) is evicted
//     on the spot; everybody else still receives the event.
// 3.  **No Replay, No Durability**: An observer sees only what is published while
//     it is joined. Nothing is stored for latecomers.
// 4.  **Short Critical Section**: The registry lock is a plain `std::sync::Mutex`
//     held only for non-blocking work, so it is safe to use from any task or thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Events an observer may fall behind by before it is considered too slow.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// One progress notification from one run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProgressEvent {
    /// Identifies the run that emitted the event.
    pub run_id: u64,
    /// Position of the event within its run, starting at 0.
    pub ordinal: u64,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(run_id: u64, ordinal: u64, message: impl Into<String>) -> Self {
        Self {
            run_id,
            ordinal,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

/// The receiving side held by an observer.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<ProgressEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next event. Returns `None` once the bus has dropped this
    /// subscriber and the buffer is drained.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Concurrency-safe publish/subscribe registry for progress events.
#[derive(Debug)]
pub struct ProgressBus {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<ProgressEvent>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Registers a new observer. It receives only events published after this call.
    pub fn join(&self) -> Subscription {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.registry().insert(id, sender);
        tracing::debug!(subscriber = id.0, "progress subscriber joined");
        Subscription { id, receiver }
    }

    /// Removes an observer. Returns `false` if it was already gone.
    pub fn leave(&self, id: SubscriberId) -> bool {
        let removed = self.registry().remove(&id).is_some();
        if removed {
            tracing::debug!(subscriber = id.0, "progress subscriber left");
        }
        removed
    }

    /// Delivers `event` to every joined observer and returns how many received it.
    /// Observers that are full or disconnected are evicted.
    pub fn publish(&self, event: &ProgressEvent) -> usize {
        let mut registry = self.registry();
        let mut delivered = 0;
        let mut evicted = Vec::new();

        for (id, sender) in registry.iter() {
            match sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(subscriber = id.0, "evicting slow progress subscriber");
                    evicted.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(subscriber = id.0, "evicting disconnected progress subscriber");
                    evicted.push(*id);
                }
            }
        }

        for id in evicted {
            registry.remove(&id);
        }

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().len()
    }

    pub fn is_joined(&self, id: SubscriberId) -> bool {
        self.registry().contains_key(&id)
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<SubscriberId, mpsc::Sender<ProgressEvent>>> {
        // Every critical section leaves the map consistent, so a poisoned lock is still usable.
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
