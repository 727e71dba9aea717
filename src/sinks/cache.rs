//! Destination-validity cache for the queue sink (`SPEC_FULL.md` §4.6).
//!
//! Grounded in the teacher's `dashmap` usage for concurrent lookup structures (e.g.
//! `Daemon::semaphores`): a `DashMap` keyed by `(exchange, routing_key)`, generalized here to
//! hold a validated/failed-with-TTL state instead of a semaphore.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::Outcome;

#[derive(Debug, Clone)]
enum CacheEntry {
    Validated,
    Failed { outcome: Outcome, failed_at: Instant },
}

/// `{(exchange, routing_key) -> validated | (failed, reason, failed_at)}`. `validated` entries
/// never expire; `failed` entries expire after `failure_ttl` (default `QUEUE_FAILURE_TTL`).
pub struct DestinationCache {
    entries: DashMap<(String, String), CacheEntry>,
    failure_ttl: Duration,
}

impl DestinationCache {
    pub fn new(failure_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            failure_ttl,
        }
    }

    /// `Some(Ok(()))` if validated, `Some(Err(outcome))` if a cached failure is still live,
    /// `None` if there's no entry or a cached failure has expired (caller should re-check).
    pub fn lookup(&self, exchange: &str, routing_key: &str) -> Option<Result<(), Outcome>> {
        let key = (exchange.to_string(), routing_key.to_string());
        match self.entries.get(&key).map(|e| e.clone()) {
            Some(CacheEntry::Validated) => Some(Ok(())),
            Some(CacheEntry::Failed { outcome, failed_at }) => {
                if failed_at.elapsed() < self.failure_ttl {
                    Some(Err(outcome))
                } else {
                    self.entries.remove(&key);
                    None
                }
            }
            None => None,
        }
    }

    pub fn mark_validated(&self, exchange: &str, routing_key: &str) {
        self.entries
            .insert((exchange.to_string(), routing_key.to_string()), CacheEntry::Validated);
    }

    pub fn mark_failed(&self, exchange: &str, routing_key: &str, outcome: Outcome) {
        self.entries.insert(
            (exchange.to_string(), routing_key.to_string()),
            CacheEntry::Failed {
                outcome,
                failed_at: Instant::now(),
            },
        );
    }

    pub fn clear_destination_cache(&self, exchange: &str, routing_key: &str) {
        self.entries.remove(&(exchange.to_string(), routing_key.to_string()));
    }

    pub fn clear_all(&self) {
        self.entries.clear();
    }
}

impl Default for DestinationCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_entry_expires_after_ttl() {
        let cache = DestinationCache::new(Duration::from_millis(20));
        cache.mark_failed("", "nope", Outcome::QueueNotFound);
        assert_eq!(cache.lookup("", "nope"), Some(Err(Outcome::QueueNotFound)));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.lookup("", "nope"), None);
    }

    #[test]
    fn validated_entry_never_expires() {
        let cache = DestinationCache::new(Duration::from_millis(1));
        cache.mark_validated("ex", "rk");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.lookup("ex", "rk"), Some(Ok(())));
    }

    #[test]
    fn clear_destination_cache_removes_one_entry() {
        let cache = DestinationCache::new(Duration::from_secs(300));
        cache.mark_failed("", "a", Outcome::QueueNotFound);
        cache.mark_failed("", "b", Outcome::QueueNotFound);
        cache.clear_destination_cache("", "a");
        assert_eq!(cache.lookup("", "a"), None);
        assert!(cache.lookup("", "b").is_some());
    }
}
