//! Bounded TTL cache for provider responses.
//!
//! A cached response is only correct if its key covers every input that
//! affects the output. [`CacheKey`] makes that explicit: each field is named
//! and appended, so leaving one out is visible at the call site.

use std::collections::HashMap;
use std::fmt::{Display, Write as _};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::sync::lock;

/// Builder for cache keys made of named fields.
#[derive(Debug, Clone)]
pub struct CacheKey {
    buf: String,
}

impl CacheKey {
    /// Start a key in `namespace` (usually the provider and operation).
    pub fn new(namespace: &str) -> Self {
        Self {
            buf: namespace.to_string(),
        }
    }

    /// Append a named field. Values are length-prefixed so adjacent fields
    /// cannot run into each other.
    pub fn field(mut self, name: &str, value: impl Display) -> Self {
        let value = value.to_string();
        let _ = write!(self.buf, "|{name}:{}:{value}", value.len());
        self
    }

    /// Append an optional field; `None` is recorded as absent.
    pub fn opt_field<V: Display>(self, name: &str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.field(name, v),
            None => self.field(name, "\u{2205}"),
        }
    }

    pub fn build(self) -> String {
        self.buf
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

/// String-keyed cache with per-entry TTL and a size ceiling.
#[derive(Debug)]
pub struct ResponseCache<V> {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a live entry. Expired entries are evicted and reported as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert, evicting the oldest entry first if the cache is full.
    pub fn set(&self, key: impl Into<String>, value: V) {
        if self.max_entries == 0 {
            return;
        }
        let key = key.into();
        let mut entries = lock(&self.entries);

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}
