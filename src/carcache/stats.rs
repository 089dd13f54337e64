use std::fmt::Debug;

/// Statistics hooks for [CarCache](super::CarCache).
///
/// Every method has a no-op default, implement only what you want to observe.
pub trait CarCacheStat<K> {
    /// Record an attempt to read a key.
    fn cache_read(&mut self) {}

    /// Record a read that was served by a resident entry.
    fn cache_hit(&mut self) {}

    /// Record a read that had to call the value producer.
    fn cache_miss(&mut self) {}

    /// Record that the producer returned a value which must not be cached.
    fn uncacheable(&mut self) {}

    /// Record that the producer failed.
    fn compute_failed(&mut self) {}

    /// Record a key that was admitted to the recent set (T1) for the first time.
    fn include(&mut self, _k: &K) {}

    /// Record that a member of the recent ghost set (B1) was revived into the
    /// frequent set.
    fn ghost_recent_revive(&mut self, _k: &K) {}

    /// Record that a member of the frequent ghost set (B2) was revived into the
    /// frequent set.
    fn ghost_frequent_revive(&mut self, _k: &K) {}

    /// Record an item evicted from the recent set into its ghost set.
    fn evict_from_recent(&mut self, _k: &K) {}

    /// Record an item evicted from the frequent set into its ghost set.
    fn evict_from_frequent(&mut self, _k: &K) {}

    /// Record a referenced item the clock moved from the recent set to the
    /// frequent set.
    fn clock_promote(&mut self, _k: &K) {}

    /// Record that the cache was cleared.
    fn cache_clear(&mut self) {}

    /// The target size of the recent set after an admission. A p of 0 means the
    /// cache is fully weighted to the frequent set, a p of `max_size` fully to the
    /// recent set.
    fn p_weight(&mut self, _p: u64) {}
}

impl<K> CarCacheStat<K> for () {}

#[derive(Debug)]
/// A stat collector that traces the keys of items as they move between sets.
pub struct TraceStat {}

impl<K> CarCacheStat<K> for TraceStat
where
    K: Debug,
{
    fn include(&mut self, k: &K) {
        tracing::trace!(?k, "include");
    }

    fn ghost_recent_revive(&mut self, k: &K) {
        tracing::trace!(?k, "ghost_recent_revive");
    }

    fn ghost_frequent_revive(&mut self, k: &K) {
        tracing::trace!(?k, "ghost_frequent_revive");
    }

    fn evict_from_recent(&mut self, k: &K) {
        tracing::trace!(?k, "evict_from_recent");
    }

    fn evict_from_frequent(&mut self, k: &K) {
        tracing::trace!(?k, "evict_from_frequent");
    }

    fn clock_promote(&mut self, k: &K) {
        tracing::trace!(?k, "clock_promote");
    }
}

/// A simple track of counters from the cache
#[derive(Debug, Default, Clone)]
pub struct CountStat {
    /// The number of attempts to read from the cache
    pub reads: u64,
    /// The number of reads served from the cache
    pub hits: u64,
    /// The number of reads that called the value producer
    pub misses: u64,
    /// The number of produced values that were not cached
    pub uncacheable: u64,
    /// The number of failed productions
    pub failed: u64,
    /// The number of new keys admitted to the recent set
    pub includes: u64,
    /// The number of revivals from the recent ghost set
    pub ghost_recent_revives: u64,
    /// The number of revivals from the frequent ghost set
    pub ghost_frequent_revives: u64,
    /// The number of evictions from the recent set
    pub recent_evicts: u64,
    /// The number of evictions from the frequent set
    pub frequent_evicts: u64,
    /// The number of clock promotions from recent to frequent
    pub clock_promotes: u64,
    /// The last observed p
    pub p_weight: u64,
}

impl<K> CarCacheStat<K> for CountStat {
    fn cache_read(&mut self) {
        self.reads += 1;
    }

    fn cache_hit(&mut self) {
        self.hits += 1;
    }

    fn cache_miss(&mut self) {
        self.misses += 1;
    }

    fn uncacheable(&mut self) {
        self.uncacheable += 1;
    }

    fn compute_failed(&mut self) {
        self.failed += 1;
    }

    fn include(&mut self, _k: &K) {
        self.includes += 1;
    }

    fn ghost_recent_revive(&mut self, _k: &K) {
        self.ghost_recent_revives += 1;
    }

    fn ghost_frequent_revive(&mut self, _k: &K) {
        self.ghost_frequent_revives += 1;
    }

    fn evict_from_recent(&mut self, _k: &K) {
        self.recent_evicts += 1;
    }

    fn evict_from_frequent(&mut self, _k: &K) {
        self.frequent_evicts += 1;
    }

    fn clock_promote(&mut self, _k: &K) {
        self.clock_promotes += 1;
    }

    fn cache_clear(&mut self) {
        self.reads = 0;
        self.hits = 0;
        self.misses = 0;
    }

    fn p_weight(&mut self, p: u64) {
        self.p_weight = p;
    }
}
