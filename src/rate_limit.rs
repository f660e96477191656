use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Sliding-window limiter keyed by client identity. Windows are tracked as
/// per-key timestamp queues; stale entries are trimmed on access, and keys
/// whose window emptied are dropped so idle clients do not accumulate.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    window: Duration,
    max_requests: usize,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Denied; the oldest counted request leaves the window after this long.
    Limited { retry_after: Duration },
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn admit(&self, key: &str) -> Admission {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or(now);

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_default();

        while let Some(front) = bucket.front().copied() {
            if front < cutoff {
                bucket.pop_front();
            } else {
                break;
            }
        }

        if bucket.len() >= self.max_requests {
            let retry_after = bucket
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return Admission::Limited { retry_after };
        }

        bucket.push_back(now);

        if buckets.len() > 4096 {
            buckets.retain(|_, queue| queue.back().is_some_and(|last| *last >= cutoff));
        }

        Admission::Allowed
    }
}
