//! Per-owner submission limiter over a sliding time window.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

pub struct RateLimiter {
    limit: usize,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// A limit of zero disables limiting.
    pub fn new(limit: u32, window: Duration) -> Self {
        RateLimiter { limit: limit as usize, window, hits: Mutex::new(HashMap::new()) }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    /// Records a hit for `key`; false when the key already used its window.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.try_acquire_at(key, Instant::now())
    }

    fn try_acquire_at(&self, key: &str, now: Instant) -> bool {
        if self.limit == 0 {
            return true;
        }
        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        let q = hits.entry(key.to_string()).or_default();
        expire(q, now, self.window);
        if q.len() >= self.limit {
            return false;
        }
        q.push_back(now);
        true
    }

    /// Drops keys with no hit inside the current window.
    pub fn prune(&self) {
        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        hits.retain(|_, q| {
            expire(q, now, self.window);
            !q.is_empty()
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.hits.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn expire(q: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = q.front() {
        if now.duration_since(*front) >= window {
            q.pop_front();
        } else {
            break;
        }
    }
}
