//! Best-effort signal fan-out to subscribers.
//!
//! Each subscriber gets a bounded queue. Broadcast serializes the
//! signal once and uses a non-blocking send: a full queue drops the
//! signal for that subscriber only, a closed queue removes the
//! subscriber. No retry, no ack, no reordering.

use crate::machine::Signal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-subscriber queue depth. Slow consumers lose signals rather
/// than slowing the pipeline.
pub const SUBSCRIBER_QUEUE: usize = 32;

/// A live subscription. Dropping the receiver is sufficient cleanup;
/// the hub notices the closed queue on the next broadcast.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Arc<str>>,
}

pub struct SignalHub {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Arc<str>>>>,
    next_id: AtomicU64,
    queue_cap: usize,
}

impl SignalHub {
    pub fn new() -> Self {
        Self::with_queue_cap(SUBSCRIBER_QUEUE)
    }

    pub fn with_queue_cap(queue_cap: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_cap: queue_cap.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_cap);
        self.lock().insert(id, tx);
        debug!(id, "subscriber added");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.lock().remove(&id).is_some() {
            debug!(id, "subscriber removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Serialize once, then deliver to every subscriber without
    /// blocking. Lagged subscribers lose this signal; closed ones are
    /// dropped entirely.
    pub fn broadcast(&self, signal: &Signal) {
        let payload: Arc<str> = match serde_json::to_string(signal) {
            Ok(json) => json.into(),
            Err(err) => {
                warn!(err = %err, "signal serialization failed");
                return;
            }
        };

        let mut closed = Vec::new();
        let mut subs = self.lock();
        for (id, tx) in subs.iter() {
            match tx.try_send(payload.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(id, "SUBSCRIBER_LAGGED");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(*id);
                }
            }
        }
        for id in closed {
            subs.remove(&id);
            debug!(id, "subscriber closed, removed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, mpsc::Sender<Arc<str>>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}
