//! Time-boxed response cache keyed by request signature.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde_json::Value;
use tokio::time::Instant;

use crate::signature::RequestSignature;

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Value,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

/// Expired entries are evicted lazily by `get`; there is no background sweep.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: Mutex<HashMap<RequestSignature, CacheEntry>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached payload if it is still fresh, evicting it otherwise.
    pub fn get(&self, signature: &RequestSignature) -> Option<Value> {
        let now = Instant::now();
        let mut entries = self.lock();
        let fresh = entries.get(signature)?.is_fresh(now);
        if fresh {
            entries.get(signature).map(|entry| entry.payload.clone())
        } else {
            entries.remove(signature);
            None
        }
    }

    pub fn set(&self, signature: RequestSignature, payload: Value, ttl: Duration) {
        self.lock().insert(
            signature,
            CacheEntry {
                payload,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Drop a single entry. Returns whether one was present.
    pub fn remove(&self, signature: &RequestSignature) -> bool {
        self.lock().remove(signature).is_some()
    }

    /// Drop every entry unconditionally.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestSignature, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
