// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Coalesce concurrent calls for the same key into one execution.
//!
//! The first caller for a key runs the work and publishes the result on a
//! watch channel; callers arriving while it runs wait for that value. If the
//! leader is dropped before finishing, waiters run the work themselves.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use tokio::sync::watch;

pub(crate) struct SingleFlight<K, V> {
    inflight: DashMap<K, watch::Receiver<Option<V>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self { inflight: DashMap::new() }
    }
}

/// Removes the leader's entry even if the leader future is dropped.
struct Lease<'a, K: Eq + Hash, V> {
    map: &'a DashMap<K, watch::Receiver<Option<V>>>,
    key: K,
    own: watch::Receiver<Option<V>>,
}

impl<K: Eq + Hash, V> Drop for Lease<'_, K, V> {
    fn drop(&mut self) {
        self.map.remove_if(&self.key, |_, rx| rx.same_channel(&self.own));
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Returns the value and whether this caller ran the work.
    pub(crate) async fn run<F, Fut>(&self, key: K, work: F) -> (V, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        // Decide leader or follower before any await; the entry holds a shard lock
        let role = match self.inflight.entry(key.clone()) {
            Entry::Occupied(entry) => Err(entry.get().clone()),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(rx);
                Ok(tx)
            }
        };

        let tx = match role {
            Ok(tx) => tx,
            Err(mut rx) => {
                loop {
                    let current = rx.borrow_and_update().clone();
                    if let Some(value) = current {
                        return (value, false);
                    }
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                // Leader went away without a result
                return (work().await, true);
            }
        };

        let _lease = Lease { map: &self.inflight, key, own: tx.subscribe() };
        let value = work().await;
        tx.send_replace(Some(value.clone()));
        (value, true)
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}
