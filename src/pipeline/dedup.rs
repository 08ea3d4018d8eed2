//! Bounded recency cache of issued notification keys.
//!
//! Used when the delivery channel does not collapse repeats itself. Entries
//! expire after `window`; once `capacity` is reached the oldest entry is
//! evicted first.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

pub struct RecentKeys {
    window: Duration,
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    issued: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl Inner {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((key, at)) = self.order.front() {
            if now.duration_since(*at) < window {
                break;
            }
            // Only drop the map entry if it was not re-issued later.
            if self.issued.get(key) == Some(at) {
                self.issued.remove(key);
            }
            self.order.pop_front();
        }
    }
}

impl RecentKeys {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Whether `key` was issued within the window.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.prune(now, self.window);
        inner.issued.contains_key(key)
    }

    /// Remember `key` as issued now.
    pub fn insert(&self, key: &str) {
        if self.capacity == 0 || self.window.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.prune(now, self.window);
        inner.issued.insert(key.to_string(), now);
        inner.order.push_back((key.to_string(), now));
        while inner.issued.len() > self.capacity {
            let Some((oldest, at)) = inner.order.pop_front() else {
                break;
            };
            if inner.issued.get(&oldest) == Some(&at) {
                inner.issued.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.prune(Instant::now(), self.window);
        inner.issued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
