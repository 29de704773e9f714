//! Idle-time tracking for cached sandboxes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Tracks last access per pipeline id for TTL-based eviction.
#[derive(Debug)]
pub struct ExpiryTracker {
    access_times: HashMap<String, Instant>,
    /// `None` disables expiry.
    ttl: Option<Duration>,
}

impl ExpiryTracker {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            access_times: HashMap::new(),
            ttl,
        }
    }

    /// Record an access (resets the entry's TTL).
    pub fn touch(&mut self, id: &str) {
        self.touch_at(id, Instant::now());
    }

    pub fn touch_at(&mut self, id: &str, at: Instant) {
        self.access_times.insert(id.to_string(), at);
    }

    pub fn is_expired(&self, id: &str) -> bool {
        self.is_expired_at(id, Instant::now())
    }

    /// Untracked ids are never expired; they have nothing cached.
    pub fn is_expired_at(&self, id: &str, now: Instant) -> bool {
        match (self.ttl, self.access_times.get(id)) {
            (Some(ttl), Some(last)) => now.saturating_duration_since(*last) > ttl,
            _ => false,
        }
    }

    pub fn remove(&mut self, id: &str) {
        self.access_times.remove(id);
    }

    /// Ids whose last access is older than the TTL. Entries are not removed;
    /// callers re-check under their own lock before evicting.
    pub fn expired(&self) -> Vec<String> {
        self.expired_at(Instant::now())
    }

    pub fn expired_at(&self, now: Instant) -> Vec<String> {
        let Some(ttl) = self.ttl else {
            return Vec::new();
        };
        let mut expired: Vec<String> = self
            .access_times
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();
        expired
    }

    pub fn clear(&mut self) {
        self.access_times.clear();
    }

    pub fn len(&self) -> usize {
        self.access_times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.access_times.is_empty()
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }
}
