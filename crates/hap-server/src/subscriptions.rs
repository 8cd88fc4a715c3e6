//! Subscription table and batched event delivery.
//!
//! Tracks which connections want notifications for which characteristics
//! and delivers each distinct change exactly once per subscriber. Inside
//! a batch, changes are accumulated per connection and flushed as one
//! event message when the batch completes; outside a batch, a change is
//! sent immediately as a one-entry message.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::event::{event_payload, PendingNotification};
use crate::traits::EventConnection;

type CharKey = (u64, u64);

#[derive(Default)]
struct Inner {
    /// (aid, iid) -> connection id -> connection.
    subscriptions: HashMap<CharKey, HashMap<u64, Arc<dyn EventConnection>>>,
    /// Reverse index for connection teardown.
    by_connection: HashMap<u64, HashSet<CharKey>>,
    /// Open batch nesting depth.
    batch_depth: u32,
    /// Accumulated changes per connection while a batch is open.
    pending: HashMap<u64, (Arc<dyn EventConnection>, Vec<PendingNotification>)>,
}

/// Cross-connection subscription state.
///
/// All message composition happens under the table lock so concurrent
/// writers can never interleave partial notification sets for the same
/// connection; actual delivery happens after the lock is released.
#[derive(Default)]
pub struct SubscriptionTable {
    inner: Mutex<Inner>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to a characteristic. Idempotent.
    pub fn add_subscription(&self, aid: u64, iid: u64, connection: Arc<dyn EventConnection>) {
        let mut inner = self.lock();
        let key = (aid, iid);
        inner
            .subscriptions
            .entry(key)
            .or_default()
            .insert(connection.id(), Arc::clone(&connection));
        inner
            .by_connection
            .entry(connection.id())
            .or_default()
            .insert(key);
        tracing::debug!(aid, iid, conn = connection.id(), "subscription added");
    }

    /// Remove one subscription. No-op if absent.
    pub fn remove_subscription(&self, aid: u64, iid: u64, connection_id: u64) {
        let mut inner = self.lock();
        let key = (aid, iid);
        if let Some(subscribers) = inner.subscriptions.get_mut(&key) {
            subscribers.remove(&connection_id);
            if subscribers.is_empty() {
                inner.subscriptions.remove(&key);
            }
        }
        if let Some(keys) = inner.by_connection.get_mut(&connection_id) {
            keys.remove(&key);
        }
    }

    /// Drop every subscription held by a closing connection.
    pub fn remove_connection(&self, connection_id: u64) {
        let mut inner = self.lock();
        if let Some(keys) = inner.by_connection.remove(&connection_id) {
            for key in keys {
                if let Some(subscribers) = inner.subscriptions.get_mut(&key) {
                    subscribers.remove(&connection_id);
                    if subscribers.is_empty() {
                        inner.subscriptions.remove(&key);
                    }
                }
            }
        }
        inner.pending.remove(&connection_id);
    }

    /// Drop all subscriptions (bridge shutdown).
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.subscriptions.clear();
        inner.by_connection.clear();
        inner.pending.clear();
    }

    /// Open a batch region. May nest; only the outermost close flushes.
    pub fn batch_update(&self) {
        self.lock().batch_depth += 1;
    }

    /// Close a batch region, flushing one event message per connection.
    pub fn complete_update_batch(&self) {
        let deliveries = {
            let mut inner = self.lock();
            if inner.batch_depth == 0 {
                tracing::warn!("complete_update_batch without open batch");
                return;
            }
            inner.batch_depth -= 1;
            if inner.batch_depth > 0 {
                return;
            }
            let pending = std::mem::take(&mut inner.pending);
            pending
                .into_values()
                .map(|(connection, entries)| (connection, event_payload(&entries)))
                .collect::<Vec<_>>()
        };

        for (connection, body) in deliveries {
            deliver(&connection, body);
        }
    }

    /// Record a value change for a characteristic.
    ///
    /// Inside a batch the change is queued; outside it is delivered
    /// immediately as a one-entry message.
    pub fn publish(&self, aid: u64, iid: u64, value: Value) {
        let deliveries = {
            let mut inner = self.lock();
            let subscribers: Vec<Arc<dyn EventConnection>> = match inner
                .subscriptions
                .get(&(aid, iid))
            {
                Some(subscribers) => subscribers.values().cloned().collect(),
                None => return,
            };

            if inner.batch_depth > 0 {
                for connection in subscribers {
                    let entry = inner
                        .pending
                        .entry(connection.id())
                        .or_insert_with(|| (Arc::clone(&connection), Vec::new()));
                    entry.1.push(PendingNotification {
                        aid,
                        iid,
                        value: value.clone(),
                    });
                }
                return;
            }

            subscribers
                .into_iter()
                .map(|connection| {
                    let body = event_payload(&[PendingNotification {
                        aid,
                        iid,
                        value: value.clone(),
                    }]);
                    (connection, body)
                })
                .collect::<Vec<_>>()
        };

        for (connection, body) in deliveries {
            deliver(&connection, body);
        }
    }

    /// Guard that closes the batch on drop, so a failure mid-batch still
    /// flushes what was accumulated.
    pub fn batch_guard(&self) -> BatchGuard<'_> {
        self.batch_update();
        BatchGuard { table: self }
    }

    #[cfg(test)]
    fn subscriber_count(&self, aid: u64, iid: u64) -> usize {
        self.lock()
            .subscriptions
            .get(&(aid, iid))
            .map(|s| s.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Subscription state survives a panicked writer
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn deliver(connection: &Arc<dyn EventConnection>, body: Vec<u8>) {
    if !connection.can_receive_events() {
        tracing::debug!(conn = connection.id(), "dropping event for inactive connection");
        return;
    }
    connection.push_event(body);
}

/// RAII wrapper around `batch_update`/`complete_update_batch`.
pub struct BatchGuard<'a> {
    table: &'a SubscriptionTable,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.table.complete_update_batch();
    }
}
