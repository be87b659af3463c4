//! Bounded map whose entries expire after a fixed time-to-live.
//!
//! Deadlines live in an ordered index next to the entries, so purging is a
//! walk from the front of the index. Every eviction is published on a
//! broadcast channel and also returned to the caller that triggered it.

use crate::error::{BumperError, BumperResult};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Why an entry left the map without being removed by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Expired,
    /// Pushed out to make room for a newer entry.
    Capacity,
}

/// Published whenever an entry is evicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub key: String,
    pub reason: EvictionReason,
}

struct Slot<V> {
    value: V,
    deadline: Instant,
    seq: u64,
}

pub struct ExpiringMap<V> {
    entries: HashMap<String, Slot<V>>,
    deadlines: BTreeMap<(Instant, u64), String>,
    ttl: Duration,
    capacity: usize,
    next_seq: u64,
    events: broadcast::Sender<Eviction>,
}

impl<V> ExpiringMap<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            entries: HashMap::new(),
            deadlines: BTreeMap::new(),
            ttl,
            capacity: capacity.max(1),
            next_seq: 0,
            events,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe to eviction events.
    pub fn subscribe(&self) -> broadcast::Receiver<Eviction> {
        self.events.subscribe()
    }

    /// Insert a new key; a live entry under the same key is an error.
    pub fn insert(&mut self, key: impl Into<String>, value: V) -> BumperResult<Vec<(String, V)>> {
        let key = key.into();
        let mut evicted = self.purge_expired();
        if self.entries.contains_key(&key) {
            return Err(BumperError::Duplicate(key));
        }
        evicted.extend(self.make_room());
        self.put(key, value);
        Ok(evicted)
    }

    /// Insert or overwrite, restarting the entry's time-to-live.
    pub fn upsert(&mut self, key: impl Into<String>, value: V) -> Vec<(String, V)> {
        let key = key.into();
        let mut evicted = self.purge_expired();
        if let Some(old) = self.entries.remove(&key) {
            self.deadlines.remove(&(old.deadline, old.seq));
        } else {
            evicted.extend(self.make_room());
        }
        self.put(key, value);
        evicted
    }

    /// Take a live entry out of the map.
    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.purge_expired();
        let slot = self.entries.remove(key)?;
        self.deadlines.remove(&(slot.deadline, slot.seq));
        Some(slot.value)
    }

    /// Take the entry under `key` only when `pred` accepts it.
    pub fn remove_if(&mut self, key: &str, pred: impl FnOnce(&V) -> bool) -> Option<V> {
        match self.entries.get(key) {
            Some(slot) if pred(&slot.value) => self.remove(key),
            _ => None,
        }
    }

    pub fn contains_key(&mut self, key: &str) -> bool {
        self.purge_expired();
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest pending deadline, for scheduling a sweep.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Evict every entry whose deadline has passed.
    pub fn purge_expired(&mut self) -> Vec<(String, V)> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        while let Some(entry) = self.deadlines.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let key = entry.remove();
            if let Some(slot) = self.entries.remove(&key) {
                self.notify(&key, EvictionReason::Expired);
                evicted.push((key, slot.value));
            }
        }
        evicted
    }

    fn make_room(&mut self) -> Vec<(String, V)> {
        let mut evicted = Vec::new();
        while self.entries.len() >= self.capacity {
            let Some((_, key)) = self.deadlines.pop_first() else {
                break;
            };
            if let Some(slot) = self.entries.remove(&key) {
                self.notify(&key, EvictionReason::Capacity);
                evicted.push((key, slot.value));
            }
        }
        evicted
    }

    fn put(&mut self, key: String, value: V) {
        let deadline = Instant::now() + self.ttl;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.deadlines.insert((deadline, seq), key.clone());
        self.entries.insert(key, Slot { value, deadline, seq });
    }

    fn notify(&self, key: &str, reason: EvictionReason) {
        // No subscribers is fine.
        let _ = self.events.send(Eviction {
            key: key.to_string(),
            reason,
        });
    }
}
