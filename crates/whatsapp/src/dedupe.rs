use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

/// TTL cache of message keys already reacted to.
///
/// The service redelivers messages after reconnects; the cache keeps a second
/// delivery of the same status from producing a second reaction.
pub struct DedupeCache {
    entries: HashMap<String, Instant>,
    ttl: Duration,
    max_entries: usize,
}

impl DedupeCache {
    pub const DEFAULT_MAX_ENTRIES: usize = 4096;

    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, Self::DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Returns true if the key is a duplicate (already seen within TTL).
    pub fn check_and_insert(&mut self, key: &str) -> bool {
        self.evict_expired();
        if self.entries.contains_key(key) {
            return true;
        }
        if self.entries.len() >= self.max_entries
            && let Some(oldest_key) = self
                .entries
                .iter()
                .min_by_key(|(_, inserted_at)| **inserted_at)
                .map(|(k, _)| k.clone())
        {
            self.entries.remove(&oldest_key);
        }
        self.entries.insert(key.to_string(), Instant::now());
        false
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_expired(&mut self) {
        let Some(cutoff) = Instant::now().checked_sub(self.ttl) else {
            return;
        };
        self.entries.retain(|_, inserted_at| *inserted_at > cutoff);
    }
}
