//! CarCache - a self-tuning Clock with Adaptive Replacement cache.
//!
//! A CarCache is a bounded key to value cache that balances recency and frequency
//! on its own. Resident entries live in two clocks, T1 for keys seen once
//! recently and T2 for keys that proved themselves, while two ghost lists, B1 and
//! B2, remember the keys recently evicted from each. A hit on a ghost tells the
//! cache which side it starved, and the target size of T1, `p`, moves toward it.
//!
//! Hits never reorder anything. A reader takes the shard's lock in shared mode,
//! sets the entry's reference flag and clones the value out, so hits proceed in
//! parallel with each other. Misses go through a single exclusive section per
//! shard: the key is re-checked, the value producer runs, and the admission and
//! replacement decisions are made, all while that section is held.
//!
//! With the default [LockStrategy::Global] there is one shard, so a slow producer
//! stalls every other miss in the cache, for any key. That is the price for a
//! single consistent set of lists and a single `p`. [LockStrategy::Sharded] splits
//! the cache by key hash into independent CAR caches, each with its own lists,
//! `p` and exclusive section. Misses on different shards then run in parallel,
//! but every size and `p` reported by the cache becomes a sum over shards, and
//! each shard adapts to its own slice of the workload.
//!
//! ```
//! use concar::carcache::{CarCacheBuilder, Compute};
//!
//! let cache = CarCacheBuilder::new()
//!     .set_size(128)
//!     .build()
//!     .expect("Invalid cache parameters!");
//!
//! let v = cache.get_or_compute(7_u64, |k| Compute::<u64, ()>::Value(k * 6));
//! assert_eq!(v.ok(), Some(42));
//! // The second read is a hit.
//! assert_eq!(cache.get(&7), Some(42));
//! ```

#[cfg(feature = "asynch")]
pub mod asynch;
mod clock;
mod engine;
mod ghost;
mod ll;
/// Stats collection for [CarCache]
pub mod stats;

use self::engine::CarInner;
use self::stats::CarCacheStat;
use crate::hash::RandomState;

pub use self::engine::Liveness;
pub use crate::error::{CarBuildError, CarError};

use crossbeam_utils::CachePadded;
use std::borrow::Borrow;
use std::fmt::{self, Debug};
use std::hash::{BuildHasher, Hash};
use std::num::NonZeroUsize;
use parking_lot::ReentrantMutex;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, trace};

/// What a value producer hands back on a cache miss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compute<V, E> {
    /// Cache this value and return it.
    Value(V),
    /// Return this value, but do not cache it.
    Uncacheable(V),
    /// The producer failed. The error is returned as [CarError::Compute].
    Failed(E),
}

impl<V, E> From<Result<V, E>> for Compute<V, E> {
    fn from(r: Result<V, E>) -> Self {
        match r {
            Ok(v) => Compute::Value(v),
            Err(e) => Compute::Failed(e),
        }
    }
}

/// How the cache serialises misses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LockStrategy {
    /// One exclusive section for the whole cache. Every miss, for any key, waits
    /// for the miss in progress to finish.
    #[default]
    Global,
    /// Split the cache by key hash into this many independent CAR caches, each
    /// with its own exclusive section, lists and `p`. The cache size is divided
    /// between the shards.
    Sharded(NonZeroUsize),
}

impl LockStrategy {
    fn shards(self) -> usize {
        match self {
            LockStrategy::Global => 1,
            LockStrategy::Sharded(n) => n.get(),
        }
    }
}

/// Plain data configuration for a cache, loadable with serde when the `serde`
/// feature is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CarCacheConfig {
    /// The maximum number of resident values.
    pub max_size: usize,
    /// How misses are serialised.
    #[cfg_attr(feature = "serde", serde(default))]
    pub lock_strategy: LockStrategy,
}

/// A configurable builder to create new CAR caches.
pub struct CarCacheBuilder<K, V> {
    max: Option<usize>,
    lock_strategy: LockStrategy,
    liveness: Option<Arc<Liveness<K, V>>>,
}

impl<K, V> Default for CarCacheBuilder<K, V> {
    fn default() -> Self {
        CarCacheBuilder {
            max: None,
            lock_strategy: LockStrategy::Global,
            liveness: None,
        }
    }
}

impl<K, V> CarCacheBuilder<K, V> {
    /// Create a new builder that you can configure before creation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a builder from a loaded configuration.
    pub fn from_config(config: &CarCacheConfig) -> Self {
        Self::new()
            .set_size(config.max_size)
            .set_lock_strategy(config.lock_strategy)
    }

    /// Set the maximum number of resident values. Up to twice as many keys are
    /// remembered in total, counting the ghost lists.
    #[must_use]
    pub fn set_size(mut self, max: usize) -> Self {
        self.max = Some(max);
        self
    }

    /// Choose how misses are serialised. Defaults to [LockStrategy::Global].
    #[must_use]
    pub fn set_lock_strategy(mut self, lock_strategy: LockStrategy) -> Self {
        self.lock_strategy = lock_strategy;
        self
    }

    /// Install a liveness check for entries whose referents can be reclaimed
    /// outside the cache.
    ///
    /// The check receives the key and, for resident entries, the value. Ghost
    /// keys are checked with `None`. Entries that fail it read as misses and are
    /// swept by `clear_stale_references`. Without a check every entry is owned
    /// by the cache and the sweep does nothing.
    #[must_use]
    pub fn set_liveness<F>(mut self, f: F) -> Self
    where
        F: Fn(&K, Option<&V>) -> bool + Send + Sync + 'static,
    {
        self.liveness = Some(Arc::new(f));
        self
    }

    // Shard capacities, the remainder going to the lowest shards.
    fn shard_sizes(&self) -> Result<Vec<usize>, CarBuildError> {
        let max = match self.max {
            Some(max) if max > 0 => max,
            _ => return Err(CarBuildError::ZeroCapacity),
        };
        // Up to twice max keys are remembered, counting the ghosts.
        if max > usize::MAX / 2 {
            return Err(CarBuildError::TooLarge { max });
        }
        let shards = self.lock_strategy.shards();
        if shards > max {
            return Err(CarBuildError::TooManyShards { shards, max });
        }
        Ok((0..shards)
            .map(|i| max / shards + usize::from(i < max % shards))
            .collect())
    }

    /// Build the blocking cache.
    pub fn build(self) -> Result<CarCache<K, V>, CarBuildError>
    where
        K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
        V: Clone + Debug + Send + Sync + 'static,
    {
        let sizes = self.shard_sizes()?;
        debug!(shards = sizes.len(), max = ?self.max, "building car cache");
        Ok(CarCache {
            shards: Shards::new(&sizes, self.liveness, || ReentrantMutex::new(())),
        })
    }

    /// Build the async cache, whose misses await their producer.
    #[cfg(feature = "asynch")]
    pub fn build_async(self) -> Result<asynch::AsyncCarCache<K, V>, CarBuildError>
    where
        K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
        V: Clone + Debug + Send + Sync + 'static,
    {
        let sizes = self.shard_sizes()?;
        debug!(shards = sizes.len(), max = ?self.max, "building async car cache");
        Ok(asynch::AsyncCarCache::from_shards(Shards::new(
            &sizes,
            self.liveness,
            || tokio::sync::Mutex::new(()),
        )))
    }
}

pub(crate) struct Shard<K, V, L> {
    // Serialises misses and structural changes. The producer runs while it is held.
    exclusive: L,
    inner: RwLock<CarInner<K, V>>,
}

impl<K, V, L> Shard<K, V, L> {
    // The state is only mutated after the producer returns, so a poisoned lock
    // still guards consistent lists. Neither guard is held while a producer
    // runs, so a reentrant producer can take them itself.
    fn read(&self) -> RwLockReadGuard<'_, CarInner<K, V>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CarInner<K, V>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The shard table shared by the blocking and async front-ends.
pub(crate) struct Shards<K, V, L> {
    shards: Box<[CachePadded<Shard<K, V, L>>]>,
    hasher: RandomState,
    max: usize,
}

impl<K, V, L> Shards<K, V, L>
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
{
    fn new<F>(sizes: &[usize], liveness: Option<Arc<Liveness<K, V>>>, make_lock: F) -> Self
    where
        F: Fn() -> L,
    {
        let shards = sizes
            .iter()
            .map(|max| {
                CachePadded::new(Shard {
                    exclusive: make_lock(),
                    inner: RwLock::new(CarInner::new(*max, liveness.clone())),
                })
            })
            .collect();
        Shards {
            shards,
            hasher: RandomState::default(),
            max: sizes.iter().sum(),
        }
    }

    fn shard_for<Q>(&self, k: &Q) -> &Shard<K, V, L>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if self.shards.len() == 1 {
            &*self.shards[0]
        } else {
            let idx = (self.hasher.hash_one(k) % self.shards.len() as u64) as usize;
            &*self.shards[idx]
        }
    }

    fn iter(&self) -> impl Iterator<Item = &Shard<K, V, L>> {
        self.shards.iter().map(|s| &**s)
    }

    fn lookup<Q, S>(&self, k: &Q, stats: &mut S) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        S: CarCacheStat<K>,
    {
        stats.cache_read();
        let hit = self.shard_for(k).read().lookup(k);
        if hit.is_some() {
            stats.cache_hit();
        }
        hit
    }

    fn contains_key<Q>(&self, k: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard_for(k).read().contains_key(k)
    }

    // Runs with the shard's exclusive section held and the key re-checked.
    fn finish_miss<S, E>(
        shard: &Shard<K, V, L>,
        k: K,
        computed: Compute<V, E>,
        stats: &mut S,
    ) -> Result<V, CarError<E>>
    where
        S: CarCacheStat<K>,
    {
        match computed {
            Compute::Value(v) => {
                shard.write().admit(k, v.clone(), stats);
                Ok(v)
            }
            Compute::Uncacheable(v) => {
                trace!(?k, "producer result is not cacheable");
                stats.uncacheable();
                Ok(v)
            }
            Compute::Failed(e) => {
                debug!(?k, "value producer failed");
                stats.compute_failed();
                Err(CarError::Compute(e))
            }
        }
    }

    fn sum<F>(&self, f: F) -> usize
    where
        F: Fn(&CarInner<K, V>) -> usize,
    {
        self.iter().map(|s| f(&*s.read())).sum()
    }

    fn dump_all_lists(&self) -> String {
        let mut out = String::new();
        for (i, shard) in self.iter().enumerate() {
            if self.shards.len() > 1 {
                out.push_str(&format!("shard {}:\n", i));
            }
            // Writing to a String can not fail.
            let _ = shard.read().dump_into(&mut out);
        }
        out
    }

    fn summary(&self, name: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(t1={}, t2={}, b1={}, b2={}, p={}, max={}, shards={})",
            name,
            self.sum(|i| i.t1_len()),
            self.sum(|i| i.t2_len()),
            self.sum(|i| i.b1_len()),
            self.sum(|i| i.b2_len()),
            self.sum(|i| i.p()),
            self.max,
            self.shards.len()
        )
    }

    #[cfg(test)]
    fn verify(&self) {
        for shard in self.iter() {
            shard.read().verify();
        }
        // Every shard must have room for at least one entry.
        for shard in self.iter() {
            assert!(shard.read().max() >= 1);
        }
    }
}

/// A concurrently readable Clock with Adaptive Replacement cache, that calls a
/// value producer on a miss.
pub struct CarCache<K, V> {
    shards: Shards<K, V, ReentrantMutex<()>>,
}

impl<K, V> CarCache<K, V>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    V: Clone + Debug + Send + Sync + 'static,
{
    /// Read a resident value. A hit marks the entry as referenced and does not
    /// block behind a miss in progress, except for the brief moment its result
    /// is admitted.
    pub fn get<Q>(&self, k: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shards.lookup(k, &mut ())
    }

    /// As [get](Self::get), recording into `stats`.
    pub fn get_stats<Q, S>(&self, k: &Q, stats: &mut S) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        S: CarCacheStat<K>,
    {
        self.shards.lookup(k, stats)
    }

    /// Is `k` resident. Does not count as a reference.
    pub fn contains_key<Q>(&self, k: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shards.contains_key(k)
    }

    /// Return the value for `k`, calling `f` to produce it on a miss.
    ///
    /// The producer runs inside the shard's exclusive section. With
    /// [LockStrategy::Global] this means that a slow producer delays every
    /// other miss in the cache until it returns. The section is reentrant, so
    /// a producer may itself read, compute, remove or clear on this cache from
    /// the same thread.
    pub fn get_or_compute<F, E>(&self, k: K, f: F) -> Result<V, CarError<E>>
    where
        F: FnOnce(&K) -> Compute<V, E>,
    {
        self.get_or_compute_stats(k, f, &mut ())
    }

    /// As [get_or_compute](Self::get_or_compute), recording into `stats`.
    pub fn get_or_compute_stats<F, E, S>(
        &self,
        k: K,
        f: F,
        stats: &mut S,
    ) -> Result<V, CarError<E>>
    where
        F: FnOnce(&K) -> Compute<V, E>,
        S: CarCacheStat<K>,
    {
        if let Some(v) = self.shards.lookup(&k, stats) {
            return Ok(v);
        }

        let shard = self.shards.shard_for(&k);
        let _guard = shard.exclusive.lock();
        // Another thread may have included it while we waited.
        let hit = shard.read().lookup(&k);
        if let Some(v) = hit {
            stats.cache_hit();
            return Ok(v);
        }

        stats.cache_miss();
        let computed = f(&k);
        Shards::finish_miss(shard, k, computed, stats)
    }

    /// Forget `k`, whether it is resident or a ghost. Returns if anything was
    /// removed.
    pub fn remove<Q>(&self, k: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let shard = self.shards.shard_for(k);
        let _guard = shard.exclusive.lock();
        shard.write().remove(k)
    }

    /// Empty every list and reset `p`.
    pub fn clear(&self) {
        self.clear_stats(&mut ())
    }

    /// As [clear](Self::clear), recording into `stats`.
    pub fn clear_stats<S>(&self, stats: &mut S)
    where
        S: CarCacheStat<K>,
    {
        for shard in self.shards.iter() {
            let _guard = shard.exclusive.lock();
            shard.write().clear();
        }
        stats.cache_clear();
        debug!("car cache cleared");
    }

    /// Forget every key, resident or ghost, for which `f` returns true. Returns
    /// the number of keys removed.
    pub fn release_matching<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let released: usize = self
            .shards
            .iter()
            .map(|shard| {
                let _guard = shard.exclusive.lock();
                shard.write().release_matching(&mut f)
            })
            .sum();
        debug!(released, "release_matching");
        released
    }

    /// Sweep out entries that fail the liveness check set with
    /// [CarCacheBuilder::set_liveness]. Returns the number of entries removed,
    /// which is always zero without a liveness check.
    pub fn clear_stale_references(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                let _guard = shard.exclusive.lock();
                shard.write().clear_stale_references()
            })
            .sum()
    }

    /// The configured maximum number of resident values.
    pub fn max_size(&self) -> usize {
        self.shards.max
    }

    /// The adaptive target size of the recent set.
    pub fn p(&self) -> usize {
        self.shards.sum(|i| i.p())
    }

    /// Number of entries in the recent clock.
    pub fn t1_len(&self) -> usize {
        self.shards.sum(|i| i.t1_len())
    }

    /// Number of entries in the frequent clock.
    pub fn t2_len(&self) -> usize {
        self.shards.sum(|i| i.t2_len())
    }

    /// Number of keys in the recent ghost list.
    pub fn b1_len(&self) -> usize {
        self.shards.sum(|i| i.b1_len())
    }

    /// Number of keys in the frequent ghost list.
    pub fn b2_len(&self) -> usize {
        self.shards.sum(|i| i.b2_len())
    }

    /// Every key the cache knows about, resident and ghost.
    pub fn key_count(&self) -> usize {
        self.shards.sum(|i| i.key_count())
    }

    /// The number of resident values.
    pub fn value_count(&self) -> usize {
        self.shards.sum(|i| i.value_count())
    }

    /// A human readable listing of `p` and all four lists, for diagnostics.
    /// Referenced entries are marked with `*`.
    pub fn dump_all_lists(&self) -> String {
        self.shards.dump_all_lists()
    }

    #[cfg(test)]
    pub(crate) fn verify(&self) {
        self.shards.verify()
    }
}

impl<K, V> Debug for CarCache<K, V>
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.shards.summary("CarCache", f)
    }
}
