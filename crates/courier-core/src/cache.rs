//! Bounded in-memory TTL cache.
//!
//! Constructed once by the embedder and passed by reference to whatever
//! needs it — never a module-level singleton. Used for bot identity and
//! group-administrator lookups.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct TtlCache<V> {
    max_items: usize,
    max_age: Duration,
    entries: Mutex<HashMap<String, (V, Instant)>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(max_items: usize, max_age: Duration) -> Self {
        Self {
            max_items,
            max_age,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn put(&self, key: &str, value: V) {
        let mut entries = self.entries.lock().unwrap();
        Self::evict(&mut entries, self.max_items, self.max_age);
        entries.insert(key.to_string(), (value, Instant::now()));
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().unwrap();
        Self::evict(&mut entries, self.max_items, self.max_age);
        entries.get(key).map(|(v, _)| v.clone())
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    /// Drop expired entries, then the oldest entries beyond `max_items`.
    fn evict(entries: &mut HashMap<String, (V, Instant)>, max_items: usize, max_age: Duration) {
        let now = Instant::now();
        entries.retain(|_, (_, at)| now.duration_since(*at) <= max_age);

        while entries.len() > max_items {
            let oldest = entries
                .iter()
                .min_by_key(|(_, (_, at))| *at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => entries.remove(&k),
                None => break,
            };
        }
    }
}
