//! Fan-out of store events to watchers.

use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::types::{
    DropReason, StoreEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId,
};

struct Watcher {
    filter: SubscriptionFilter,
    sender: Sender<StoreEvent>,
}

/// Registry of live watchers.
///
/// Broadcasting never blocks: a watcher whose buffer is full is removed
/// with a `BufferOverflow` notice, and one whose handle was dropped is
/// removed silently.
pub struct SubscriptionManager {
    watchers: RwLock<HashMap<SubscriptionId, Watcher>>,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            watchers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a watcher. Events flow from the moment it exists; there is
    /// no replay of earlier changes.
    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = bounded(config.buffer_size.max(1));

        self.watchers.write().insert(
            id,
            Watcher {
                filter: config.filter,
                sender,
            },
        );

        SubscriptionHandle { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(watcher) = self.watchers.write().remove(&id) {
            notify_dropped(&watcher, DropReason::Unsubscribed);
        }
    }

    /// Remove every watcher, telling each one why.
    pub fn close_all(&self, reason: DropReason) {
        for (_, watcher) in self.watchers.write().drain() {
            notify_dropped(&watcher, reason.clone());
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.watchers.read().len()
    }

    /// Deliver `event` to every watcher whose filter accepts it.
    pub fn broadcast(&self, event: StoreEvent) {
        let mut stale = Vec::new();
        {
            let watchers = self.watchers.read();
            for (id, watcher) in watchers.iter() {
                if !watcher.filter.matches(&event) {
                    continue;
                }
                match watcher.sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => stale.push((*id, true)),
                    Err(TrySendError::Disconnected(_)) => stale.push((*id, false)),
                }
            }
        }
        if stale.is_empty() {
            return;
        }

        let mut watchers = self.watchers.write();
        for (id, overflowed) in stale {
            let Some(watcher) = watchers.remove(&id) else {
                continue;
            };
            if overflowed {
                debug!(subscription = id.0, "dropping slow watcher");
                notify_dropped(&watcher, DropReason::BufferOverflow);
            }
        }
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

// Best effort: a full buffer just misses the notice.
fn notify_dropped(watcher: &Watcher, reason: DropReason) {
    let _ = watcher.sender.try_send(StoreEvent::Dropped { reason });
}
