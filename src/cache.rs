// Copyright 2025 Google LLC
// SPDX-License-Identifier: MIT

use std::{collections::HashMap, hash::Hash, sync, time};

/// Source of the current time for caches.
pub trait Clock: Send + Sync {
    fn now(&self) -> time::Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> time::Instant {
        time::Instant::now()
    }
}

/// A clock that only moves when told to.
#[cfg(test)]
pub struct ManualClock {
    now: sync::Mutex<time::Instant>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new() -> sync::Arc<Self> {
        sync::Arc::new(ManualClock {
            now: sync::Mutex::new(time::Instant::now()),
        })
    }

    pub fn advance(&self, dur: time::Duration) {
        *self.now.lock().unwrap() += dur;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> time::Instant {
        *self.now.lock().unwrap()
    }
}

struct Entry<V> {
    val: V,
    stored_at: time::Instant,
}

/// Time-bounded memoization.
///
/// Entries expire `ttl` after they were stored. Expired entries are dropped
/// by the `get` that notices them; nothing sweeps the map in the background.
pub struct TtlCache<K, V> {
    ttl: time::Duration,
    clock: sync::Arc<dyn Clock>,
    entries: sync::Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: time::Duration) -> Self {
        Self::with_clock(ttl, sync::Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: time::Duration, clock: sync::Arc<dyn Clock>) -> Self {
        TtlCache {
            ttl,
            clock,
            entries: sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();

        match entries.get(key) {
            Some(entry) if now.duration_since(entry.stored_at) < self.ttl => {
                Some(entry.val.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: K, val: V) {
        let stored_at = self.clock.now();
        self.entries
            .lock()
            .unwrap()
            .insert(key, Entry { val, stored_at });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
