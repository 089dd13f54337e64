//! An async CAR cache, for value producers that need to await.
//!
//! The lists are the same as [CarCache](super::CarCache). Hits are plain
//! synchronous reads. A miss holds the shard's exclusive section as a tokio
//! mutex while the producer's future runs, so waiting misses yield to the
//! runtime instead of blocking a worker thread.

use super::stats::CarCacheStat;
use super::{CarError, Compute, Shards};

use std::borrow::Borrow;
use std::fmt::{self, Debug};
use std::future::Future;
use std::hash::Hash;

use tokio::sync::Mutex;
use tracing::debug;

/// A Clock with Adaptive Replacement cache whose misses await their producer.
pub struct AsyncCarCache<K, V> {
    shards: Shards<K, V, Mutex<()>>,
}

impl<K, V> AsyncCarCache<K, V>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    V: Clone + Debug + Send + Sync + 'static,
{
    pub(crate) fn from_shards(shards: Shards<K, V, Mutex<()>>) -> Self {
        AsyncCarCache { shards }
    }

    /// Read a resident value, marking it as referenced.
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

    /// Return the value for `k`, awaiting the future made by `f` on a miss.
    ///
    /// The producer is given its own copy of the key. Other misses on the same
    /// shard wait until the future completes. Unlike [CarCache](super::CarCache)
    /// the section is not reentrant: a producer that awaits another miss,
    /// `remove` or `clear` on the same shard never completes.
    pub async fn get_or_compute<F, Fut, E>(&self, k: K, f: F) -> Result<V, CarError<E>>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Compute<V, E>>,
    {
        self.get_or_compute_stats(k, f, &mut ()).await
    }

    /// As [get_or_compute](Self::get_or_compute), recording into `stats`.
    pub async fn get_or_compute_stats<F, Fut, E, S>(
        &self,
        k: K,
        f: F,
        stats: &mut S,
    ) -> Result<V, CarError<E>>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Compute<V, E>>,
        S: CarCacheStat<K>,
    {
        if let Some(v) = self.shards.lookup(&k, stats) {
            return Ok(v);
        }

        let shard = self.shards.shard_for(&k);
        let _guard = shard.exclusive.lock().await;
        let hit = shard.read().lookup(&k);
        if let Some(v) = hit {
            stats.cache_hit();
            return Ok(v);
        }

        stats.cache_miss();
        let computed = f(k.clone()).await;
        Shards::finish_miss(shard, k, computed, stats)
    }

    /// Forget `k`, whether it is resident or a ghost.
    pub async fn remove<Q>(&self, k: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let shard = self.shards.shard_for(k);
        let _guard = shard.exclusive.lock().await;
        shard.write().remove(k)
    }

    /// Empty every list and reset `p`.
    pub async fn clear(&self) {
        for shard in self.shards.iter() {
            let _guard = shard.exclusive.lock().await;
            shard.write().clear();
        }
        debug!("async car cache cleared");
    }

    /// Forget every key for which `f` returns true. Returns the number removed.
    pub async fn release_matching<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let mut released = 0;
        for shard in self.shards.iter() {
            let _guard = shard.exclusive.lock().await;
            released += shard.write().release_matching(&mut f);
        }
        debug!(released, "release_matching");
        released
    }

    /// Sweep out entries that fail the liveness check.
    pub async fn clear_stale_references(&self) -> usize {
        let mut swept = 0;
        for shard in self.shards.iter() {
            let _guard = shard.exclusive.lock().await;
            swept += shard.write().clear_stale_references();
        }
        swept
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

    /// A human readable listing of `p` and all four lists.
    pub fn dump_all_lists(&self) -> String {
        self.shards.dump_all_lists()
    }
}

impl<K, V> Debug for AsyncCarCache<K, V>
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.shards.summary("AsyncCarCache", f)
    }
}

#[cfg(test)]
mod tests {
    use super::AsyncCarCache;
    use crate::carcache::stats::CountStat;
    use crate::carcache::{CarCacheBuilder, Compute, LockStrategy};
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn cache(max: usize) -> AsyncCarCache<u64, String> {
        CarCacheBuilder::new()
            .set_size(max)
            .build_async()
            .expect("Invalid cache parameters!")
    }

    #[tokio::test]
    async fn test_async_car_cache_basic() {
        let cache = cache(4);
        let mut stats = CountStat::default();

        let v = cache
            .get_or_compute_stats(
                1,
                |k| async move { Compute::<_, ()>::Value(format!("v{}", k)) },
                &mut stats,
            )
            .await;
        assert_eq!(v.ok().as_deref(), Some("v1"));
        assert_eq!(cache.get(&1).as_deref(), Some("v1"));
        assert!(cache.contains_key(&1));
        assert_eq!(stats.misses, 1);

        let v = cache
            .get_or_compute(2, |_| async { Compute::<String, ()>::Uncacheable("tmp".to_string()) })
            .await;
        assert_eq!(v.ok().as_deref(), Some("tmp"));
        assert!(!cache.contains_key(&2));

        let v = cache
            .get_or_compute(3, |_| async { Compute::<String, &str>::Failed("interrupted") })
            .await;
        assert_eq!(v.err().map(|e| e.into_inner()), Some("interrupted"));
        assert_eq!(cache.value_count(), 1);

        assert!(cache.remove(&1).await);
        assert!(!cache.remove(&1).await);
        assert_eq!(cache.key_count(), 0);
    }

    #[tokio::test]
    async fn test_async_car_cache_eviction_and_clear() {
        let cache = cache(2);
        for k in 0..5_u64 {
            let _ = cache
                .get_or_compute(k, |k| async move { Compute::<_, ()>::Value(k.to_string()) })
                .await;
            assert!(cache.value_count() <= 2);
        }
        assert_eq!(cache.t1_len(), 2);
        assert!(cache.key_count() <= 4);

        assert_eq!(cache.release_matching(|k| *k == 4).await, 1);
        assert_eq!(cache.clear_stale_references().await, 0);
        cache.clear().await;
        assert_eq!(cache.key_count(), 0);
        assert_eq!(cache.p(), 0);
        assert_eq!(cache.dump_all_lists(), "p=0\nT1: []\nT2: []\nB1: []\nB2: []\n");
        cache.shards.verify();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_async_car_cache_concurrent_miss_computes_once() {
        let cache: Arc<AsyncCarCache<u64, String>> = Arc::new(
            CarCacheBuilder::new()
                .set_size(8)
                .set_lock_strategy(LockStrategy::Sharded(NonZeroUsize::new(2).unwrap()))
                .build_async()
                .unwrap(),
        );
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_compute(42, |k| async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Compute::<_, ()>::Value(k.to_string())
                        })
                        .await
                        .ok()
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().as_deref(), Some("42"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            format!("{:?}", cache),
            "AsyncCarCache(t1=1, t2=0, b1=0, b2=0, p=0, max=8, shards=2)"
        );
    }
}
