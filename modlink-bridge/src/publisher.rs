//! Snapshot fan-out to observers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::store::{RegisterStore, Snapshot};

/// Identifier of a registered observer.
pub type ObserverId = u64;

/// A registered observer's receiving end.
///
/// The first message is always the snapshot that was current at subscribe
/// time. The channel ends when the observer is removed or the publisher
/// closes.
#[derive(Debug)]
pub struct Subscription {
    pub id: ObserverId,
    pub receiver: mpsc::Receiver<Arc<Snapshot>>,
}

#[derive(Debug, Default)]
struct Registry {
    observers: HashMap<ObserverId, mpsc::Sender<Arc<Snapshot>>>,
    closed: bool,
}

/// Pushes snapshots to every registered observer.
///
/// Delivery never waits on an observer: a full queue drops that observer's
/// copy of the snapshot, a closed queue unregisters it.
#[derive(Clone, Debug)]
pub struct Publisher {
    store: RegisterStore,
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
    buffer: usize,
}

impl Publisher {
    /// Create a publisher reading initial snapshots from `store`.
    ///
    /// `buffer` is the number of snapshots queued per observer.
    pub fn new(store: RegisterStore, buffer: usize) -> Self {
        Self {
            store,
            registry: Arc::new(Mutex::new(Registry::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            buffer: buffer.max(1),
        }
    }

    /// Register an observer and queue the current snapshot for it.
    ///
    /// Returns `None` once the publisher is closed.
    pub fn subscribe(&self) -> Option<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);

        let mut registry = self.registry.lock();
        if registry.closed {
            return None;
        }

        // Queued while holding the registry lock, so no broadcast can reach
        // this observer before its initial snapshot.
        if tx.try_send(self.store.snapshot()).is_err() {
            return None;
        }
        registry.observers.insert(id, tx);

        debug!(observer = id, observers = registry.observers.len(), "Observer subscribed");
        Some(Subscription { id, receiver: rx })
    }

    /// Remove an observer. Removing an unknown observer is not an error.
    pub fn unsubscribe(&self, id: ObserverId) {
        if self.registry.lock().observers.remove(&id).is_some() {
            debug!(observer = id, "Observer unsubscribed");
        }
    }

    /// Deliver `snapshot` to every observer.
    pub fn broadcast(&self, snapshot: Arc<Snapshot>) -> BroadcastStats {
        let targets: Vec<(ObserverId, mpsc::Sender<Arc<Snapshot>>)> = {
            let registry = self.registry.lock();
            registry
                .observers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut stats = BroadcastStats::default();
        let mut gone = Vec::new();

        for (id, tx) in targets {
            match tx.try_send(snapshot.clone()) {
                Ok(()) => stats.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    stats.dropped += 1;
                    warn!(observer = id, version = snapshot.version, "Observer lagging, snapshot dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    stats.closed += 1;
                    gone.push(id);
                }
            }
        }

        if !gone.is_empty() {
            let mut registry = self.registry.lock();
            for id in gone {
                registry.observers.remove(&id);
            }
        }

        stats
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.registry.lock().observers.len()
    }

    /// Drop every observer and refuse new ones.
    pub fn close(&self) {
        let mut registry = self.registry.lock();
        registry.closed = true;
        let count = registry.observers.len();
        registry.observers.clear();
        debug!(observers = count, "Publisher closed");
    }

    pub fn is_closed(&self) -> bool {
        self.registry.lock().closed
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Observers that received the snapshot.
    pub delivered: usize,
    /// Observers whose queue was full.
    pub dropped: usize,
    /// Observers found disconnected and removed.
    pub closed: usize,
}

impl BroadcastStats {
    /// Total number of observers attempted.
    pub fn total(&self) -> usize {
        self.delivered + self.dropped + self.closed
    }
}
