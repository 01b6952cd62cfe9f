// Copyright 2025 Lagoon Contributors (https://github.com/lagoondb/lagoon)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Reactive cache
//!
//! Keyed store of the latest value per live query, with synchronous
//! subscriber fan-out. [`ReactiveCache::set_and_notify`] is the only mutator
//! that fires observers; callbacks run in the writer's context, after the
//! entry is committed and outside the cache lock, in subscription order.
//!
//! The cache does not serialize concurrent writers. Callers that need
//! atomic read-modify-write use [`crate::optimistic::OptimisticTransaction`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::trace;

use lagoon_core::{CacheKey, Value};

/// Where a cache entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// Confirmed result of a request/response query
    ServerQuery,
    /// Server-pushed subscription update
    ServerSubscription,
    /// Speculative local write awaiting confirmation
    OptimisticUpdate,
}

/// One committed cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    pub source: UpdateSource,
    /// Cache-wide monotonically increasing write sequence number; the
    /// optimistic store's rollback race guard compares against it.
    pub seq: u64,
    pub written_at: SystemTime,
}

type Observer = Arc<dyn Fn(&Value) + Send + Sync>;

/// Token returned by [`ReactiveCache::subscribe`]. Unsubscribing twice with
/// the same token is a no-op.
#[derive(Debug, Clone)]
pub struct SubscriberToken {
    key: CacheKey,
    id: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    observers: HashMap<CacheKey, Vec<(u64, Observer)>>,
    next_observer_id: u64,
    next_seq: u64,
}

/// Live local cache of query results.
#[derive(Default)]
pub struct ReactiveCache {
    inner: Mutex<CacheInner>,
}

impl ReactiveCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest value for a key; `None` when absent. Never blocks beyond the
    /// cache lock.
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        self.inner.lock().entries.get(key).map(|e| e.value.clone())
    }

    /// Full entry including source and sequence number.
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Commit a value and notify every observer of the key, synchronously in
    /// the caller's context. Returns the entry's write sequence number.
    pub fn set_and_notify(&self, key: &CacheKey, value: Value, source: UpdateSource) -> u64 {
        let (seq, observers) = {
            let mut inner = self.inner.lock();
            inner.next_seq += 1;
            let seq = inner.next_seq;
            inner.entries.insert(
                key.clone(),
                CacheEntry {
                    value: value.clone(),
                    source,
                    seq,
                    written_at: SystemTime::now(),
                },
            );
            (seq, inner.snapshot_observers(key))
        };
        trace!(%key, ?source, seq, observers = observers.len(), "cache write");
        for observer in &observers {
            observer(&value);
        }
        seq
    }

    /// Remove an entry without notifying. Used when rolling back an
    /// optimistic write to a key that previously had no value.
    pub fn remove(&self, key: &CacheKey) {
        self.inner.lock().entries.remove(key);
    }

    /// Register an observer for a key. Multiple observers per key are
    /// supported and notified in subscription order.
    pub fn subscribe(
        &self,
        key: &CacheKey,
        observer: impl Fn(&Value) + Send + Sync + 'static,
    ) -> SubscriberToken {
        let mut inner = self.inner.lock();
        inner.next_observer_id += 1;
        let id = inner.next_observer_id;
        inner
            .observers
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(observer)));
        SubscriberToken {
            key: key.clone(),
            id,
        }
    }

    /// Remove one observer; others on the same key are untouched.
    pub fn unsubscribe(&self, token: &SubscriberToken) {
        let mut inner = self.inner.lock();
        if let Some(list) = inner.observers.get_mut(&token.key) {
            list.retain(|(id, _)| *id != token.id);
            if list.is_empty() {
                inner.observers.remove(&token.key);
            }
        }
    }

    /// Snapshot of the currently cached keys.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    /// Restore `prior` for `key` only if the entry's sequence number still
    /// equals `expected_seq`; a newer write (e.g. server truth arriving
    /// during the race window) wins and the restore is a no-op.
    ///
    /// A `prior` of `None` means the key did not exist before the optimistic
    /// write and is removed silently; otherwise the restore notifies with
    /// source [`UpdateSource::ServerQuery`] so observers see reverted truth.
    pub(crate) fn rollback_if_unchanged(
        &self,
        key: &CacheKey,
        expected_seq: u64,
        prior: Option<Value>,
    ) {
        let (restored, observers) = {
            let mut inner = self.inner.lock();
            match inner.entries.get(key) {
                Some(entry) if entry.seq == expected_seq => {}
                _ => return,
            }
            match prior {
                None => {
                    inner.entries.remove(key);
                    return;
                }
                Some(value) => {
                    inner.next_seq += 1;
                    let seq = inner.next_seq;
                    inner.entries.insert(
                        key.clone(),
                        CacheEntry {
                            value: value.clone(),
                            source: UpdateSource::ServerQuery,
                            seq,
                            written_at: SystemTime::now(),
                        },
                    );
                    (value, inner.snapshot_observers(key))
                }
            }
        };
        trace!(%key, "optimistic write rolled back");
        for observer in &observers {
            observer(&restored);
        }
    }
}

impl CacheInner {
    fn snapshot_observers(&self, key: &CacheKey) -> Vec<Observer> {
        self.observers
            .get(key)
            .map(|list| list.iter().map(|(_, o)| o.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name, &Value::empty_object())
    }

    #[test]
    fn test_get_absent_is_none() {
        let cache = ReactiveCache::new();
        assert_eq!(cache.get(&key("q")), None);
    }

    #[test]
    fn test_set_then_get() {
        let cache = ReactiveCache::new();
        cache.set_and_notify(&key("q"), Value::Int64(1), UpdateSource::ServerQuery);
        assert_eq!(cache.get(&key("q")), Some(Value::Int64(1)));
    }

    #[test]
    fn test_observers_fire_synchronously_in_write_order() {
        let cache = ReactiveCache::new();
        let seen: Arc<PMutex<Vec<i64>>> = Arc::default();
        let sink = seen.clone();
        cache.subscribe(&key("q"), move |v| {
            sink.lock().push(v.as_i64().unwrap());
        });
        for n in 1..=3 {
            cache.set_and_notify(&key("q"), Value::Int64(n), UpdateSource::ServerQuery);
        }
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_multiple_observers_notified_in_subscription_order() {
        let cache = ReactiveCache::new();
        let order: Arc<PMutex<Vec<&'static str>>> = Arc::default();
        let first = order.clone();
        let second = order.clone();
        cache.subscribe(&key("q"), move |_| first.lock().push("first"));
        cache.subscribe(&key("q"), move |_| second.lock().push("second"));
        cache.set_and_notify(&key("q"), Value::Null, UpdateSource::ServerQuery);
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_unsubscribe_leaves_other_observers() {
        let cache = ReactiveCache::new();
        let count_a = Arc::new(PMutex::new(0));
        let count_b = Arc::new(PMutex::new(0));
        let a = count_a.clone();
        let b = count_b.clone();
        let token = cache.subscribe(&key("q"), move |_| *a.lock() += 1);
        cache.subscribe(&key("q"), move |_| *b.lock() += 1);

        cache.set_and_notify(&key("q"), Value::Null, UpdateSource::ServerQuery);
        cache.unsubscribe(&token);
        // double unsubscribe is a no-op
        cache.unsubscribe(&token);
        cache.set_and_notify(&key("q"), Value::Null, UpdateSource::ServerQuery);

        assert_eq!(*count_a.lock(), 1);
        assert_eq!(*count_b.lock(), 2);
    }

    #[test]
    fn test_observers_are_per_key() {
        let cache = ReactiveCache::new();
        let count = Arc::new(PMutex::new(0));
        let c = count.clone();
        cache.subscribe(&key("a"), move |_| *c.lock() += 1);
        cache.set_and_notify(&key("b"), Value::Null, UpdateSource::ServerQuery);
        assert_eq!(*count.lock(), 0);
    }

    #[test]
    fn test_seq_increases_per_write() {
        let cache = ReactiveCache::new();
        let s1 = cache.set_and_notify(&key("q"), Value::Int64(1), UpdateSource::ServerQuery);
        let s2 = cache.set_and_notify(&key("q"), Value::Int64(2), UpdateSource::ServerSubscription);
        assert!(s2 > s1);
        assert_eq!(cache.entry(&key("q")).unwrap().seq, s2);
    }

    #[test]
    fn test_remove_is_silent() {
        let cache = ReactiveCache::new();
        let count = Arc::new(PMutex::new(0));
        let c = count.clone();
        cache.subscribe(&key("q"), move |_| *c.lock() += 1);
        cache.set_and_notify(&key("q"), Value::Null, UpdateSource::ServerQuery);
        cache.remove(&key("q"));
        assert_eq!(cache.get(&key("q")), None);
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_keys_snapshot() {
        let cache = ReactiveCache::new();
        cache.set_and_notify(&key("a"), Value::Null, UpdateSource::ServerQuery);
        cache.set_and_notify(&key("b"), Value::Null, UpdateSource::ServerQuery);
        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec![key("a"), key("b")]);
    }

    #[test]
    fn test_reentrant_subscribe_from_observer_does_not_deadlock() {
        // Observers run outside the cache lock, so a callback may subscribe.
        let cache = Arc::new(ReactiveCache::new());
        let inner = cache.clone();
        cache.subscribe(&key("q"), move |_| {
            inner.subscribe(&key("other"), |_| {});
        });
        cache.set_and_notify(&key("q"), Value::Null, UpdateSource::ServerQuery);
    }
}
