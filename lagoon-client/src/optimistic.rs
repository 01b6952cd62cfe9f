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

//! Optimistic local store
//!
//! A unit of speculative work over the reactive cache. The first write to a
//! key within a transaction snapshots the value observed immediately before
//! it, so rollback can restore it (or remove the key if it did not exist).
//!
//! Rollback is guarded by the cache's write sequence numbers: if a
//! server-confirmed value lands on a key after the optimistic write, the
//! entry's sequence number no longer matches the transaction's and rollback
//! leaves the newer server value in place.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use lagoon_core::{CacheKey, Value};

use crate::cache::{ReactiveCache, UpdateSource};

struct TouchedKey {
    /// Value observed before this transaction's first write; `None` means
    /// the key did not exist.
    prior: Option<Value>,
    /// Sequence number of this transaction's latest write to the key
    last_seq: u64,
}

/// One optimistic unit of work.
///
/// Observer callbacks triggered by [`set_query`](Self::set_query) run while
/// the transaction's bookkeeping lock is held; they must not write back into
/// the same transaction.
pub struct OptimisticTransaction {
    cache: Arc<ReactiveCache>,
    touched: Mutex<HashMap<CacheKey, TouchedKey>>,
}

impl OptimisticTransaction {
    pub fn new(cache: Arc<ReactiveCache>) -> Self {
        Self {
            cache,
            touched: Mutex::new(HashMap::new()),
        }
    }

    /// Read through to the cache.
    pub fn get_query(&self, function_path: &str, args: &Value) -> Option<Value> {
        self.cache.get(&CacheKey::new(function_path, args))
    }

    /// Speculatively write a query result. Subscribers are notified
    /// immediately with source [`UpdateSource::OptimisticUpdate`].
    ///
    /// The pre-write snapshot is taken exactly once per key per transaction,
    /// no matter how many times the key is written.
    pub fn set_query(&self, function_path: &str, args: &Value, value: Value) {
        let key = CacheKey::new(function_path, args);
        let mut touched = self.touched.lock();
        let prior = match touched.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(_) => Some(self.cache.get(&key)),
        };
        let seq = self
            .cache
            .set_and_notify(&key, value, UpdateSource::OptimisticUpdate);
        match touched.entry(key) {
            Entry::Occupied(mut entry) => entry.get_mut().last_seq = seq,
            Entry::Vacant(entry) => {
                entry.insert(TouchedKey {
                    prior: prior.flatten(),
                    last_seq: seq,
                });
            }
        }
    }

    /// Keys written by this transaction so far.
    pub fn modified_queries(&self) -> Vec<CacheKey> {
        self.touched.lock().keys().cloned().collect()
    }

    /// Per-key snapshots taken before the first write; `None` marks a key
    /// that did not exist.
    pub fn original_values(&self) -> HashMap<CacheKey, Option<Value>> {
        self.touched
            .lock()
            .iter()
            .map(|(k, t)| (k.clone(), t.prior.clone()))
            .collect()
    }

    /// Drop the bookkeeping; optimistic values stay in the cache until a
    /// server-confirmed write supersedes them.
    pub fn commit(&self) {
        self.touched.lock().clear();
    }

    /// Restore every touched key to its pre-transaction value, unless a
    /// newer write already superseded the optimistic one. Idempotent: a
    /// second call sees no touched keys.
    pub fn rollback(&self) {
        let touched = mem::take(&mut *self.touched.lock());
        if touched.is_empty() {
            return;
        }
        warn!(keys = touched.len(), "rolling back optimistic transaction");
        for (key, t) in touched {
            self.cache.rollback_if_unchanged(&key, t.last_seq, t.prior);
        }
    }
}
