use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

/// Minimum spacing between awareness broadcasts of one connection
pub const DEFAULT_AWARENESS_INTERVAL: Duration = Duration::from_millis(50);

/// Per-key rate limiter owned by whoever needs it (a session, a relay connection).
///
/// A call is allowed when the key has not been allowed within the last `interval`.
#[derive(Debug)]
pub struct Throttle<K> {
    interval: Duration,
    last: HashMap<K, Instant>,
}

impl<K: Eq + Hash> Throttle<K> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: HashMap::new(),
        }
    }

    pub fn allow(&mut self, key: K) -> bool {
        let now = Instant::now();
        match self.last.get(&key) {
            Some(at) if now.duration_since(*at) < self.interval => false,
            _ => {
                self.last.insert(key, now);
                true
            }
        }
    }

    /// Forget a key, e.g. when its connection closes
    pub fn reset(&mut self, key: &K) {
        self.last.remove(key);
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

impl<K: Eq + Hash> Default for Throttle<K> {
    fn default() -> Self {
        Self::new(DEFAULT_AWARENESS_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_allows_once_per_interval() {
        let mut throttle = Throttle::new(Duration::from_millis(50));
        assert!(throttle.allow("alice"));
        assert!(!throttle.allow("alice"));
        assert!(throttle.allow("bob"));

        tokio::time::advance(Duration::from_millis(30)).await;
        assert!(!throttle.allow("alice"));

        tokio::time::advance(Duration::from_millis(25)).await;
        assert!(throttle.allow("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forgets_key() {
        let mut throttle = Throttle::default();
        assert!(throttle.allow(7u64));
        throttle.reset(&7);
        assert!(throttle.is_empty());
        assert!(throttle.allow(7));
    }
}
