//! Seen-identity tracking for frame dedup

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq)]
enum Entry {
    Delivered,
    /// Load failed; retry only if the file changes
    Failed {
        size_bytes: u64,
        modified_at: DateTime<Utc>,
    },
}

/// Bounded set of frame identities already handled
///
/// Identities are kept in insertion order. Once the set grows past its
/// capacity, the oldest identities that are no longer listed by the source
/// are evicted; a still-listed identity is never forgotten.
#[derive(Debug)]
pub struct SeenFrames {
    entries: HashMap<String, Entry>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenFrames {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a listed frame should be loaded
    pub fn should_load(&self, identity: &str, size_bytes: u64, modified_at: DateTime<Utc>) -> bool {
        match self.entries.get(identity) {
            None => true,
            Some(Entry::Delivered) => false,
            Some(Entry::Failed {
                size_bytes: size,
                modified_at: modified,
            }) => *size != size_bytes || *modified != modified_at,
        }
    }

    pub fn mark_delivered(&mut self, identity: &str) {
        self.insert(identity, Entry::Delivered);
    }

    pub fn mark_failed(&mut self, identity: &str, size_bytes: u64, modified_at: DateTime<Utc>) {
        self.insert(
            identity,
            Entry::Failed {
                size_bytes,
                modified_at,
            },
        );
    }

    fn insert(&mut self, identity: &str, entry: Entry) {
        if self.entries.insert(identity.to_string(), entry).is_none() {
            self.order.push_back(identity.to_string());
        }
    }

    /// Evict old identities absent from `listed` until back under capacity
    ///
    /// Returns how many identities were evicted.
    pub fn prune<'a>(&mut self, listed: impl IntoIterator<Item = &'a str>) -> usize {
        if self.entries.len() <= self.capacity {
            return 0;
        }

        let listed: HashSet<&str> = listed.into_iter().collect();
        let mut excess = self.entries.len() - self.capacity;
        let mut kept = VecDeque::with_capacity(self.order.len());
        let mut evicted = 0;

        while let Some(identity) = self.order.pop_front() {
            if excess > 0 && !listed.contains(identity.as_str()) {
                self.entries.remove(&identity);
                excess -= 1;
                evicted += 1;
            } else {
                kept.push_back(identity);
            }
        }
        self.order = kept;
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivered_identity_is_never_reloaded() {
        let now = Utc::now();
        let mut seen = SeenFrames::new(10);
        assert!(seen.should_load("a.jpg", 10, now));
        seen.mark_delivered("a.jpg");
        assert!(!seen.should_load("a.jpg", 10, now));
        assert!(!seen.should_load("a.jpg", 99, now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_failed_identity_retried_only_when_changed() {
        let now = Utc::now();
        let mut seen = SeenFrames::new(10);
        seen.mark_failed("a.jpg", 0, now);

        assert!(!seen.should_load("a.jpg", 0, now));
        assert!(seen.should_load("a.jpg", 2048, now));

        seen.mark_delivered("a.jpg");
        assert!(!seen.should_load("a.jpg", 2048, now));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_prune_keeps_listed_identities() {
        let mut seen = SeenFrames::new(2);
        for name in ["a", "b", "c", "d"] {
            seen.mark_delivered(name);
        }

        // "a" is still on disk, so "b" and "c" go first
        let evicted = seen.prune(["a", "d"]);
        assert_eq!(evicted, 2);
        assert_eq!(seen.len(), 2);
        assert!(!seen.should_load("a", 0, Utc::now()));
        assert!(seen.should_load("b", 0, Utc::now()));
    }

    #[test]
    fn test_prune_never_evicts_listed_even_over_capacity() {
        let mut seen = SeenFrames::new(1);
        seen.mark_delivered("a");
        seen.mark_delivered("b");

        assert_eq!(seen.prune(["a", "b"]), 0);
        assert_eq!(seen.len(), 2);
    }
}
