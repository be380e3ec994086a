//! Sliding-window rate limiter, per client.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Inner {
    requests: HashMap<String, VecDeque<Instant>>,
    last_cleanup: Instant,
}

/// Allows at most `requests_per_minute` per client in any sliding 60 s
/// window. The client key is the user id when authenticated, the remote
/// address otherwise.
#[derive(Debug)]
pub struct RateLimiter {
    requests_per_minute: usize,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: usize) -> Self {
        Self {
            requests_per_minute,
            inner: Mutex::new(Inner {
                requests: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Record an attempt and report whether it is admitted.
    pub fn is_allowed(&self, client_id: &str) -> bool {
        let now = Instant::now();
        let mut inner = lock(&self.inner);

        if now.duration_since(inner.last_cleanup) > CLEANUP_INTERVAL {
            inner.requests.retain(|_, times| {
                while times.front().is_some_and(|t| now.duration_since(*t) > WINDOW) {
                    times.pop_front();
                }
                !times.is_empty()
            });
            inner.last_cleanup = now;
        }

        let times = inner.requests.entry(client_id.to_string()).or_default();
        while times.front().is_some_and(|t| now.duration_since(*t) > WINDOW) {
            times.pop_front();
        }
        if times.len() >= self.requests_per_minute {
            return false;
        }
        times.push_back(now);
        true
    }

    pub fn retry_after_secs(&self) -> u64 {
        WINDOW.as_secs()
    }

    pub fn tracked_clients(&self) -> usize {
        lock(&self.inner).requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn enforces_the_per_minute_limit() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.is_allowed("client"));
        assert!(limiter.is_allowed("client"));
        assert!(limiter.is_allowed("client"));
        assert!(!limiter.is_allowed("client"));
        assert_eq!(limiter.retry_after_secs(), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_rather_than_resetting() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.is_allowed("client"));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(limiter.is_allowed("client"));
        assert!(!limiter.is_allowed("client"));

        // 31 more seconds: the first request has left the window, the
        // second has not.
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(limiter.is_allowed("client"));
        assert!(!limiter.is_allowed("client"));
    }

    #[tokio::test(start_paused = true)]
    async fn clients_are_isolated() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.is_allowed("a"));
        assert!(limiter.is_allowed("b"));
        assert!(!limiter.is_allowed("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_clients_are_cleaned_up() {
        let limiter = RateLimiter::new(5);
        assert!(limiter.is_allowed("transient"));
        assert_eq!(limiter.tracked_clients(), 1);

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(limiter.is_allowed("other"));
        assert_eq!(limiter.tracked_clients(), 1);
    }
}
