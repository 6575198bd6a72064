//! Short-lived stats cache keyed by engine address and unit id

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::collector::ContainerStats;

struct Entry {
    stats: ContainerStats,
    stored_at: Instant,
}

/// Concurrent cache of recent stats samples
pub struct StatsCache {
    ttl: Duration,
    entries: DashMap<String, Entry>,
}

impl StatsCache {
    /// Create a cache whose entries expire after `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Cache key for a unit on an engine
    pub fn key(address: &str, unit_id: &str) -> String {
        format!("{}|{}", address, unit_id)
    }

    /// A fresh sample, if one is held
    pub fn get(&self, key: &str) -> Option<ContainerStats> {
        let entry = self.entries.get(key)?;
        (entry.stored_at.elapsed() < self.ttl).then(|| entry.stats.clone())
    }

    /// Store a sample and evict stale entries
    pub fn insert(&self, key: String, stats: ContainerStats) {
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.stored_at.elapsed() < ttl);
        self.entries.insert(
            key,
            Entry {
                stats,
                stored_at: Instant::now(),
            },
        );
    }

    /// Number of entries held, stale ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds nothing
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(pids: u64) -> ContainerStats {
        ContainerStats {
            pids,
            ..Default::default()
        }
    }

    #[test]
    fn test_hit_within_ttl() {
        let cache = StatsCache::new(Duration::from_secs(20));
        let key = StatsCache::key("tcp://10.0.0.1:2376", "c1");
        assert_eq!(key, "tcp://10.0.0.1:2376|c1");
        assert!(cache.get(&key).is_none());

        cache.insert(key.clone(), stats(7));
        assert_eq!(cache.get(&key).unwrap().pids, 7);
        assert!(cache.get(&StatsCache::key("tcp://10.0.0.2:2376", "c1")).is_none());
    }

    #[test]
    fn test_stale_entries_expire_and_evict() {
        let cache = StatsCache::new(Duration::ZERO);
        cache.insert("a|1".to_string(), stats(1));
        assert!(cache.get("a|1").is_none());

        cache.insert("b|2".to_string(), stats(2));
        assert_eq!(cache.len(), 1);
    }
}
