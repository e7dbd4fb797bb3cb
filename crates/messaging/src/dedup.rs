//! Bounded, time-limited memory of recently processed event IDs.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use common::EventId;

/// Remembers event IDs for `ttl`, holding at most `capacity` of them.
///
/// Each partition worker owns one cache. Redeliveries of an event carry the
/// same saga key, so they always reach the worker that saw the original.
#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    ttl: Duration,
    seen: HashMap<EventId, Instant>,
    order: VecDeque<(EventId, Instant)>,
}

impl DedupCache {
    /// Creates an empty cache.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns true if the event was recorded and has not expired.
    pub fn contains(&self, event_id: &EventId) -> bool {
        self.contains_at(event_id, Instant::now())
    }

    /// Records an event as processed.
    pub fn insert(&mut self, event_id: EventId) {
        self.insert_at(event_id, Instant::now());
    }

    /// Number of remembered events, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn contains_at(&self, event_id: &EventId, now: Instant) -> bool {
        self.seen
            .get(event_id)
            .is_some_and(|seen_at| now.duration_since(*seen_at) < self.ttl)
    }

    fn insert_at(&mut self, event_id: EventId, now: Instant) {
        self.evict(now);
        self.seen.insert(event_id, now);
        self.order.push_back((event_id, now));

        while self.seen.len() > self.capacity {
            let Some((oldest, at)) = self.order.pop_front() else {
                break;
            };
            self.remove_if_current(oldest, at);
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some((event_id, at)) = self.order.front().copied() {
            if now.duration_since(at) < self.ttl {
                break;
            }
            self.order.pop_front();
            self.remove_if_current(event_id, at);
        }
    }

    // A re-inserted ID has a newer timestamp; leave it alone.
    fn remove_if_current(&mut self, event_id: EventId, at: Instant) {
        if self.seen.get(&event_id) == Some(&at) {
            self.seen.remove(&event_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remembers_inserted_ids() {
        let mut cache = DedupCache::new(10, Duration::from_secs(60));
        let id = EventId::new();

        assert!(!cache.contains(&id));
        cache.insert(id);
        assert!(cache.contains(&id));
        assert!(!cache.contains(&EventId::new()));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let mut cache = DedupCache::new(10, Duration::from_secs(5));
        let id = EventId::new();
        let start = Instant::now();

        cache.insert_at(id, start);
        assert!(cache.contains_at(&id, start + Duration::from_secs(4)));
        assert!(!cache.contains_at(&id, start + Duration::from_secs(5)));

        cache.insert_at(EventId::new(), start + Duration::from_secs(6));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let mut cache = DedupCache::new(2, Duration::from_secs(60));
        let (a, b, c) = (EventId::new(), EventId::new(), EventId::new());

        cache.insert(a);
        cache.insert(b);
        cache.insert(c);

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&a));
        assert!(cache.contains(&b));
        assert!(cache.contains(&c));
    }

    #[test]
    fn reinsert_refreshes_entry() {
        let mut cache = DedupCache::new(2, Duration::from_secs(60));
        let (a, b, c) = (EventId::new(), EventId::new(), EventId::new());
        let start = Instant::now();

        cache.insert_at(a, start);
        cache.insert_at(b, start + Duration::from_millis(1));
        cache.insert_at(a, start + Duration::from_millis(2));
        cache.insert_at(c, start + Duration::from_millis(3));

        let now = start + Duration::from_millis(4);
        assert!(cache.contains_at(&a, now));
        assert!(!cache.contains_at(&b, now));
        assert!(cache.contains_at(&c, now));
    }
}
