//! The CAR state machine: two clocks, two ghost lists and the adaptive target `p`.
//!
//! Nothing here locks. The front-ends own an instance per shard behind an
//! `RwLock`, readers take it shared for `lookup`, every other method runs with
//! the shard's exclusive section held.

use std::borrow::Borrow;
use std::fmt::{self, Debug, Write};
use std::hash::Hash;
use std::sync::Arc;

use tracing::{debug, trace};

use super::clock::{CarEntry, ClockList};
use super::ghost::GhostList;
use super::stats::CarCacheStat;

/// The liveness capability threaded through every entry. Given a key, and its
/// value when the key is resident, it reports whether the entry's referent is
/// still alive. Ghost keys are probed with `None`.
pub type Liveness<K, V> = dyn Fn(&K, Option<&V>) -> bool + Send + Sync;

pub(crate) struct CarInner<K, V> {
    max: usize,
    /// Adaptive target size of the recent set.
    p: usize,
    t1: ClockList<K, V>,
    t2: ClockList<K, V>,
    b1: GhostList<K>,
    b2: GhostList<K>,
    liveness: Option<Arc<Liveness<K, V>>>,
}

impl<K, V> CarInner<K, V>
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
{
    pub(crate) fn new(max: usize, liveness: Option<Arc<Liveness<K, V>>>) -> Self {
        debug_assert!(max > 0 && max <= usize::MAX / 2);
        CarInner {
            max,
            p: 0,
            t1: ClockList::new(),
            t2: ClockList::new(),
            b1: GhostList::new(max),
            b2: GhostList::new(max * 2),
            liveness,
        }
    }

    fn is_live(&self, entry: &CarEntry<K, V>) -> bool {
        self.liveness
            .as_ref()
            .map_or(true, |live| live(entry.key(), Some(entry.value())))
    }

    fn resident<Q>(&self, k: &Q) -> Option<&CarEntry<K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.t1
            .get(k)
            .or_else(|| self.t2.get(k))
            .filter(|entry| self.is_live(entry))
    }

    /// Probe T1 then T2. A hit only sets the entry's reference flag.
    pub(crate) fn lookup<Q>(&self, k: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entry = self.resident(k)?;
        entry.touch();
        Some(entry.value().clone())
    }

    pub(crate) fn contains_key<Q>(&self, k: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.resident(k).is_some()
    }

    /// Admit a freshly produced value for a key that missed.
    pub(crate) fn admit<S>(&mut self, k: K, v: V, stats: &mut S)
    where
        S: CarCacheStat<K>,
    {
        // After a miss only a stale copy, or one a nested producer admitted for
        // the same key, can still be resident.
        if self.t1.remove(&k).or_else(|| self.t2.remove(&k)).is_some() {
            trace!(?k, "replaced resident entry");
        }
        debug_assert!(!self.t1.contains_key(&k) && !self.t2.contains_key(&k));

        if self.t1.len() + self.t2.len() >= self.max {
            self.replace(stats);
        }

        // Trim the history for a new key. On a full cache this follows the
        // replace above. On a cache that explicit removals left short it keeps
        // T1 + B1 and the total key count inside their bounds.
        if !self.b1.contains(&k) && !self.b2.contains(&k) {
            if self.t1.len() + self.b1.len() >= self.max {
                let _ = self.b1.remove_oldest();
            } else if self.key_count() >= 2 * self.max {
                let _ = self.b2.remove_oldest();
            }
        }

        if self.b1.contains(&k) {
            let ratio = (self.b2.len() / self.b1.len().max(1)).max(1);
            let p_was = self.p;
            self.p = (self.p + ratio).min(self.max);
            trace!(?k, p_was, p = self.p, "recent ghost revive");
            self.b1.remove(&k);
            stats.ghost_recent_revive(&k);
            self.t2.put(CarEntry::new(k, v));
        } else if self.b2.contains(&k) {
            let ratio = (self.b1.len() / self.b2.len().max(1)).max(1);
            let p_was = self.p;
            self.p = self.p.saturating_sub(ratio);
            trace!(?k, p_was, p = self.p, "frequent ghost revive");
            self.b2.remove(&k);
            stats.ghost_frequent_revive(&k);
            self.t2.put(CarEntry::new(k, v));
        } else {
            stats.include(&k);
            self.t1.put(CarEntry::new(k, v));
        }

        stats.p_weight(self.p as u64);
        self.debug_check();
    }

    // Sweep the clocks until exactly one entry has been evicted into a ghost list.
    fn replace<S>(&mut self, stats: &mut S)
    where
        S: CarCacheStat<K>,
    {
        loop {
            if self.t1.len() >= self.p.max(1) {
                let (k, referenced) = match self.t1.current() {
                    Some((k, entry)) => (k.clone(), entry.clear_reference()),
                    None => unreachable!("recent set is empty during replace"),
                };
                self.t1.advance();
                let Some(entry) = self.t1.remove(&k) else {
                    unreachable!("hand entry vanished from the recent set")
                };
                if referenced {
                    stats.clock_promote(&k);
                    self.t2.put(entry);
                } else {
                    trace!(?k, "evict from recent");
                    stats.evict_from_recent(&k);
                    if let Some(forgotten) = self.b1.add(entry.into_key()) {
                        trace!(k = ?forgotten, "recent ghost overflow");
                    }
                    return;
                }
            } else {
                let (k, referenced) = match self.t2.current() {
                    Some((k, entry)) => (k.clone(), entry.clear_reference()),
                    None => unreachable!("frequent set is empty during replace"),
                };
                self.t2.advance();
                if !referenced {
                    let Some(entry) = self.t2.remove(&k) else {
                        unreachable!("hand entry vanished from the frequent set")
                    };
                    trace!(?k, "evict from frequent");
                    stats.evict_from_frequent(&k);
                    if let Some(forgotten) = self.b2.add(entry.into_key()) {
                        trace!(k = ?forgotten, "frequent ghost overflow");
                    }
                    return;
                }
            }
        }
    }

    /// Forget `k` from the first of T1, T2, B1, B2 that holds it.
    pub(crate) fn remove<Q>(&mut self, k: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.t1.remove(k).is_some()
            || self.t2.remove(k).is_some()
            || self.b1.remove(k)
            || self.b2.remove(k)
    }

    pub(crate) fn clear(&mut self) {
        self.t1.clear();
        self.t2.clear();
        self.b1.clear();
        self.b2.clear();
        self.p = 0;
    }

    pub(crate) fn release_matching<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        self.b2.release_where(&mut f)
            + self.b1.release_where(&mut f)
            + self.t1.release_where(|k, _| f(k))
            + self.t2.release_where(|k, _| f(k))
    }

    pub(crate) fn clear_stale_references(&mut self) -> usize {
        let Some(live) = self.liveness.clone() else {
            return 0;
        };
        let swept = self.t1.release_where(|k, v| !live(k, Some(v)))
            + self.t2.release_where(|k, v| !live(k, Some(v)))
            + self.b1.release_where(|k| !live(k, None))
            + self.b2.release_where(|k| !live(k, None));
        if swept > 0 {
            debug!(swept, "cleared stale references");
        }
        swept
    }

    #[cfg(test)]
    pub(crate) fn max(&self) -> usize {
        self.max
    }

    pub(crate) fn p(&self) -> usize {
        self.p
    }

    pub(crate) fn t1_len(&self) -> usize {
        self.t1.len()
    }

    pub(crate) fn t2_len(&self) -> usize {
        self.t2.len()
    }

    pub(crate) fn b1_len(&self) -> usize {
        self.b1.len()
    }

    pub(crate) fn b2_len(&self) -> usize {
        self.b2.len()
    }

    pub(crate) fn key_count(&self) -> usize {
        self.t1.len() + self.t2.len() + self.b1.len() + self.b2.len()
    }

    pub(crate) fn value_count(&self) -> usize {
        self.t1.len() + self.t2.len()
    }

    pub(crate) fn dump_into(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "p={}", self.p)?;
        writeln!(out, "T1: {:?}", self.t1)?;
        writeln!(out, "T2: {:?}", self.t2)?;
        writeln!(out, "B1: {:?}", self.b1)?;
        writeln!(out, "B2: {:?}", self.b2)
    }

    fn debug_check(&self) {
        debug_assert!(self.t1.len() + self.t2.len() <= self.max);
        debug_assert!(self.p <= self.max);
        debug_assert!(self.t1.len() + self.b1.len() <= self.max);
        debug_assert!(self.key_count() <= 2 * self.max);
    }

    #[cfg(test)]
    pub(crate) fn verify(&self) {
        use std::collections::HashSet;

        self.t1.verify();
        self.t2.verify();
        self.b1.verify();
        self.b2.verify();
        assert!(self.t1.len() + self.t2.len() <= self.max);
        assert!(self.p <= self.max);
        assert!(self.t1.len() + self.b1.len() <= self.max);
        assert!(self.key_count() <= 2 * self.max);

        let mut seen = HashSet::new();
        for k in self
            .t1
            .keys()
            .into_iter()
            .chain(self.t2.keys())
            .chain(self.b1.keys())
            .chain(self.b2.keys())
        {
            assert!(seen.insert(k.clone()), "{:?} is in more than one list", k);
        }
    }

    #[cfg(test)]
    pub(crate) fn lists(&self) -> [Vec<K>; 4] {
        [
            self.t1.keys(),
            self.t2.keys(),
            self.b1.keys(),
            self.b2.keys(),
        ]
    }
}
