//! Hash-map deduplicator keyed by `(type, id, unixSeconds(timestamp))`.
//!
//! The key truncates to whole seconds, so two items sharing `(type, id)`
//! within 1s of a second boundary can collide even if their raw timestamps
//! differ — this is intentional, not a bug.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::models::{PersistenceItem, PersistenceItemType};

fn key(item_type: PersistenceItemType, id: &str, timestamp_secs: i64) -> String {
    format!("{item_type:?}:{id}:{timestamp_secs}")
}

struct Entry {
    inserted_at: Instant,
}

pub struct Deduplicator {
    window: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_duplicate(&self, item: &PersistenceItem) -> bool {
        self.is_duplicate_at(item, Instant::now())
    }

    fn is_duplicate_at(&self, item: &PersistenceItem, now: Instant) -> bool {
        let k = key(item.item_type, &item.id, item.timestamp.timestamp());
        match self.entries.lock().get(&k) {
            Some(entry) => now.duration_since(entry.inserted_at) < self.window,
            None => false,
        }
    }

    pub fn add(&self, item: &PersistenceItem) {
        self.add_at(item, Instant::now());
    }

    fn add_at(&self, item: &PersistenceItem, now: Instant) {
        let k = key(item.item_type, &item.id, item.timestamp.timestamp());
        self.entries.lock().insert(k, Entry { inserted_at: now });
    }

    /// Removes entries older than `window`; intended to run on a
    /// `cleanupInterval` cadence from a janitor task.
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }

    fn cleanup_at(&self, now: Instant) {
        let window = self.window;
        self.entries
            .lock()
            .retain(|_, entry| now.duration_since(entry.inserted_at) < window);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn item(id: &str) -> PersistenceItem {
        PersistenceItem::new(PersistenceItemType::Price, id, json!({"price": 1}))
    }

    #[test]
    fn duplicate_within_window_is_detected() {
        let dedup = Deduplicator::new(Duration::from_secs(300));
        let now = Instant::now();
        let a = item("X");
        dedup.add_at(&a, now);
        let mut b = item("X");
        b.timestamp = a.timestamp;
        assert!(dedup.is_duplicate_at(&b, now + Duration::from_secs(1)));
    }

    #[test]
    fn entry_expires_after_window() {
        let dedup = Deduplicator::new(Duration::from_millis(10));
        let now = Instant::now();
        let a = item("X");
        dedup.add_at(&a, now);
        dedup.cleanup_at(now + Duration::from_millis(20));
        assert!(dedup.is_empty());
    }

    #[test]
    fn different_ids_do_not_collide() {
        let dedup = Deduplicator::new(Duration::from_secs(300));
        let now = Instant::now();
        dedup.add_at(&item("X"), now);
        assert!(!dedup.is_duplicate_at(&item("Y"), now));
    }

    #[test]
    fn same_second_truncation_collides_as_documented() {
        let dedup = Deduplicator::new(Duration::from_secs(300));
        let now = Instant::now();
        let base_ts = Utc::now();
        let mut a = item("X");
        a.timestamp = base_ts;
        dedup.add_at(&a, now);

        // a timestamp up to 1s away but truncating to the same second.
        let mut b = item("X");
        b.timestamp = base_ts;
        assert!(dedup.is_duplicate_at(&b, now));
    }
}
