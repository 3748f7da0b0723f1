use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::constants::{PRICE_CACHE_MAX_ENTRIES, PRICE_CACHE_TTL_SECONDS};

/// Bounded price cache owned by the position monitor.
///
/// Capacity-bounded (LRU eviction), TTL-bounded (stale entries read as
/// misses), swept on overflow by the LRU itself and periodically by the
/// monitor's sweep timer. Not shared with any other component.
#[derive(Clone)]
pub struct PriceCache {
    inner: Arc<Mutex<LruCache<String, PriceEntry>>>,
    ttl: ChronoDuration,
    stats: Arc<Mutex<PriceCacheStats>>,
}

#[derive(Debug, Clone)]
struct PriceEntry {
    price: f64,
    fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct PriceCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub sweeps: u64,
}

impl PriceCache {
    pub fn new(max_entries: usize, ttl_seconds: u64) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).expect("non-zero capacity");
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(capacity))),
            ttl: ChronoDuration::seconds(ttl_seconds as i64),
            stats: Arc::new(Mutex::new(PriceCacheStats::default())),
        }
    }

    /// Fresh price for the mint, or None on miss / expiry.
    pub fn get(&self, token_mint: &str) -> Option<f64> {
        let now = Utc::now();
        let mut cache = self.inner.lock();
        match cache.get(token_mint) {
            Some(entry) if now.signed_duration_since(entry.fetched_at) <= self.ttl => {
                self.stats.lock().hits += 1;
                Some(entry.price)
            }
            Some(_) => {
                cache.pop(token_mint);
                let mut stats = self.stats.lock();
                stats.expired += 1;
                stats.misses += 1;
                None
            }
            None => {
                self.stats.lock().misses += 1;
                None
            }
        }
    }

    pub fn put(&self, token_mint: &str, price: f64) {
        let mut cache = self.inner.lock();
        cache.put(
            token_mint.to_string(),
            PriceEntry {
                price,
                fetched_at: Utc::now(),
            },
        );
        debug!("💾 Cached price {} = {:.12}", token_mint, price);
    }

    /// Drop entries past TTL. Called from the monitor's 5-minute sweep timer.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut cache = self.inner.lock();
        let stale: Vec<String> = cache
            .iter()
            .filter(|(_, entry)| now.signed_duration_since(entry.fetched_at) > self.ttl)
            .map(|(mint, _)| mint.clone())
            .collect();
        for mint in &stale {
            cache.pop(mint);
        }
        let removed = stale.len();
        if removed > 0 {
            info!("🧹 Price cache sweep removed {} stale entr(ies)", removed);
        }
        self.stats.lock().sweeps += 1;
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PriceCacheStats {
        self.stats.lock().clone()
    }
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new(PRICE_CACHE_MAX_ENTRIES, PRICE_CACHE_TTL_SECONDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_hit_miss_and_stats() {
        let cache = PriceCache::new(10, 10);
        assert!(cache.get("MintA").is_none());

        cache.put("MintA", 0.5);
        assert_eq!(cache.get("MintA"), Some(0.5));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn capacity_evicts_lru() {
        let cache = PriceCache::new(2, 60);
        cache.put("A", 1.0);
        cache.put("B", 2.0);
        // Touch A so B is the LRU.
        cache.get("A");
        cache.put("C", 3.0);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("B").is_none());
        assert_eq!(cache.get("A"), Some(1.0));
        assert_eq!(cache.get("C"), Some(3.0));
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let cache = PriceCache::new(10, 0);
        cache.put("A", 1.0);
        // TTL of zero: anything older than "now" is stale.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(cache.get("A").is_none());
        assert_eq!(cache.stats().expired, 1);
    }

    #[test]
    fn sweep_removes_only_stale() {
        let cache = PriceCache::new(10, 0);
        cache.put("A", 1.0);
        cache.put("B", 2.0);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(cache.sweep_expired(), 2);
        assert!(cache.is_empty());
    }
}
