// src/cache.rs
// Process-wide caches for rationales and embeddings.
// DashMap-backed, injectable, with optional TTL and oldest-first eviction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Key-value contract shared by the caches handed to the coordinator and mapper.
pub trait CacheStore<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;
    /// Stores `value` unless a live entry exists; returns whichever value is stored.
    fn insert(&self, key: &str, value: V) -> V;
    fn len(&self) -> usize;
    fn clear(&self);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug)]
struct CacheEntry<V> {
    value: V,
    inserted: Instant,
    // Insertion order, used to pick the eviction victim.
    sequence: u64,
}

#[derive(Debug)]
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    ttl: Option<Duration>,
    capacity: usize,
    sequence: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone + Send + Sync> TtlCache<V> {
    /// `capacity == 0` means unbounded.
    pub fn new(ttl: Option<Duration>, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity,
            sequence: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None, 0)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn is_expired(&self, entry: &CacheEntry<V>) -> bool {
        self.ttl.is_some_and(|ttl| entry.inserted.elapsed() > ttl)
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().sequence)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

impl<V: Clone + Send + Sync> CacheStore<V> for TtlCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        let found = match self.entries.get(key) {
            Some(entry) if !self.is_expired(&entry) => Some(entry.value.clone()),
            Some(_) => None,
            None => None,
        };
        if found.is_none() {
            // Drop outside the read guard to avoid a shard deadlock.
            self.entries.remove_if(key, |_, entry| self.is_expired(entry));
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    fn insert(&self, key: &str, value: V) -> V {
        if self.capacity > 0 && !self.entries.contains_key(key) {
            while self.entries.len() >= self.capacity {
                self.evict_oldest();
            }
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let fresh = CacheEntry {
            value: value.clone(),
            inserted: Instant::now(),
            sequence,
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if self.is_expired(occupied.get()) {
                    occupied.insert(fresh);
                    value
                } else {
                    occupied.get().value.clone()
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                value
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&self) {
        self.entries.clear();
    }
}

/// Rationale cache keyed by the elicitation fingerprint.
pub type ResponseCache = TtlCache<String>;

/// Embedding cache keyed by exact text.
pub type EmbeddingCache = TtlCache<Arc<Vec<f32>>>;
