//! The CLOCK lists (T1 and T2) of the CAR cache.
//!
//! Entries sit in a ring in insertion order, indexed by key. A hand walks the
//! ring and persists between scans, so every scan resumes where the last one
//! stopped. Hits never reorder the ring, they only set the entry's reference
//! flag.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};

use super::ll::{LLNodeRef, LL};
use crate::hash::RandomState;

/// A resident cache entry.
pub(crate) struct CarEntry<K, V> {
    k: K,
    v: V,
    // Touched since the last sweep. Readers set it without the exclusive
    // section, concurrent stores of `true` are harmless.
    referenced: AtomicBool,
}

impl<K, V> CarEntry<K, V> {
    pub(crate) fn new(k: K, v: V) -> Self {
        CarEntry {
            k,
            v,
            referenced: AtomicBool::new(false),
        }
    }

    pub(crate) fn key(&self) -> &K {
        &self.k
    }

    pub(crate) fn value(&self) -> &V {
        &self.v
    }

    #[inline]
    pub(crate) fn touch(&self) {
        self.referenced.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_referenced(&self) -> bool {
        self.referenced.load(Ordering::Relaxed)
    }

    /// Clear the reference flag, returning what it was.
    pub(crate) fn clear_reference(&self) -> bool {
        self.referenced.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn into_key(self) -> K {
        self.k
    }
}

impl<K: fmt::Debug, V> fmt::Debug for CarEntry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_referenced() {
            write!(f, "{:?}*", self.k)
        } else {
            write!(f, "{:?}", self.k)
        }
    }
}

pub(crate) struct ClockList<K, V> {
    index: HashMap<K, LLNodeRef<CarEntry<K, V>>, RandomState>,
    ring: LL<CarEntry<K, V>>,
    // None parks the hand on the oldest entry.
    hand: Option<LLNodeRef<CarEntry<K, V>>>,
}

impl<K, V> ClockList<K, V>
where
    K: Hash + Eq + Clone,
{
    pub(crate) fn new() -> Self {
        ClockList {
            index: HashMap::default(),
            ring: LL::new(),
            hand: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        debug_assert_eq!(self.index.len(), self.ring.len());
        self.ring.len()
    }

    pub(crate) fn get<Q>(&self, k: &Q) -> Option<&CarEntry<K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.get(k).map(|n| self.ring.node(*n))
    }

    pub(crate) fn contains_key<Q>(&self, k: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.contains_key(k)
    }

    /// Append an entry as the newest member of the ring.
    pub(crate) fn put(&mut self, entry: CarEntry<K, V>) {
        debug_assert!(!self.index.contains_key(entry.key()));
        let k = entry.key().clone();
        let n = self.ring.append_k(entry);
        self.index.insert(k, n);
    }

    pub(crate) fn remove<Q>(&mut self, k: &Q) -> Option<CarEntry<K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let n = self.index.remove(k)?;
        if self.hand == Some(n) {
            // Step past the node we are about to cut out.
            self.hand = self.ring.next_of(n);
        }
        let owned = self.ring.extract(n);
        Some(LL::free_n(owned))
    }

    /// The entry under the hand. Does not move the hand.
    pub(crate) fn current(&self) -> Option<(&K, &CarEntry<K, V>)> {
        let n = self.hand.or_else(|| self.ring.first())?;
        let entry = self.ring.node(n);
        Some((entry.key(), entry))
    }

    /// Move the hand one entry forward, wrapping to the oldest entry.
    pub(crate) fn advance(&mut self) {
        if let Some(n) = self.hand.or_else(|| self.ring.first()) {
            self.hand = self.ring.next_of(n);
        }
    }

    /// Remove every entry for which `f` returns true, returning how many went.
    pub(crate) fn release_where<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
    {
        let doomed: Vec<K> = self
            .ring
            .iter()
            .filter(|e| f(e.key(), e.value()))
            .map(|e| e.key().clone())
            .collect();
        for k in doomed.iter() {
            let _ = self.remove(k);
        }
        doomed.len()
    }

    pub(crate) fn clear(&mut self) {
        self.index.clear();
        self.hand = None;
        self.ring.clear();
    }

    #[cfg(test)]
    pub(crate) fn keys(&self) -> Vec<K> {
        self.ring.iter().map(|e| e.key().clone()).collect()
    }

    #[cfg(test)]
    pub(crate) fn verify(&self) {
        self.ring.verify();
        assert_eq!(self.index.len(), self.ring.len());
        for e in self.ring.iter() {
            let n = self.index.get(e.key()).expect("ring entry missing from index");
            assert!(std::ptr::eq(self.ring.node(*n), e));
        }
        if let Some(hand) = self.hand {
            assert!(self.index.values().any(|n| *n == hand));
        }
    }
}

impl<K: fmt::Debug, V> fmt::Debug for ClockList<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ring.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{CarEntry, ClockList};
    use crate::carcache::ll::assert_released;

    fn filled(keys: &[usize]) -> ClockList<usize, usize> {
        let mut cl = ClockList::new();
        for k in keys {
            cl.put(CarEntry::new(*k, *k * 10));
        }
        cl
    }

    #[test]
    fn test_clock_list_put_get_remove() {
        let mut cl = filled(&[1, 2, 3]);
        assert_eq!(cl.len(), 3);
        assert_eq!(cl.get(&2).map(|e| *e.value()), Some(20));
        assert!(cl.get(&4).is_none());
        assert!(cl.contains_key(&3));

        let e = cl.remove(&2).unwrap();
        assert_eq!(e.into_key(), 2);
        assert!(cl.remove(&2).is_none());
        assert_eq!(cl.keys(), vec![1, 3]);
        cl.verify();

        drop(cl);
        assert_released();
    }

    #[test]
    fn test_clock_list_hand_wraps() {
        let mut cl = filled(&[1, 2, 3]);
        assert_eq!(cl.current().map(|(k, _)| *k), Some(1));
        // current does not move the hand
        assert_eq!(cl.current().map(|(k, _)| *k), Some(1));
        cl.advance();
        assert_eq!(cl.current().map(|(k, _)| *k), Some(2));
        cl.advance();
        cl.advance();
        assert_eq!(cl.current().map(|(k, _)| *k), Some(1));

        // New entries join the ring behind the newest, the hand stays put.
        cl.advance();
        cl.put(CarEntry::new(4, 40));
        assert_eq!(cl.current().map(|(k, _)| *k), Some(2));
        cl.advance();
        cl.advance();
        assert_eq!(cl.current().map(|(k, _)| *k), Some(4));
        cl.verify();

        drop(cl);
        assert_released();
    }

    #[test]
    fn test_clock_list_remove_under_hand() {
        let mut cl = filled(&[1, 2, 3]);
        cl.advance();
        assert_eq!(cl.current().map(|(k, _)| *k), Some(2));
        // Removing elsewhere leaves the hand alone.
        cl.remove(&1);
        assert_eq!(cl.current().map(|(k, _)| *k), Some(2));
        // Removing the entry under the hand steps past it.
        cl.remove(&2);
        assert_eq!(cl.current().map(|(k, _)| *k), Some(3));
        cl.remove(&3);
        assert!(cl.current().is_none());
        cl.advance();
        assert_eq!(cl.len(), 0);
        cl.verify();

        cl.put(CarEntry::new(5, 50));
        assert_eq!(cl.current().map(|(k, _)| *k), Some(5));

        drop(cl);
        assert_released();
    }

    #[test]
    fn test_clock_list_reference_flag() {
        let cl = filled(&[1]);
        let e = cl.get(&1).unwrap();
        assert!(!e.is_referenced());
        e.touch();
        e.touch();
        assert!(e.is_referenced());
        assert!(e.clear_reference());
        assert!(!e.clear_reference());
        assert_eq!(format!("{:?}", cl), "[1]");
        cl.get(&1).unwrap().touch();
        assert_eq!(format!("{:?}", cl), "[1*]");

        drop(cl);
        assert_released();
    }

    #[test]
    fn test_clock_list_release_where() {
        let mut cl = filled(&[1, 2, 3, 4, 5, 6]);
        cl.advance();
        cl.advance();
        // hand on 3, which goes
        let n = cl.release_where(|k, _| k % 2 == 1);
        assert_eq!(n, 3);
        assert_eq!(cl.keys(), vec![2, 4, 6]);
        assert_eq!(cl.current().map(|(k, _)| *k), Some(4));
        assert_eq!(cl.release_where(|_, v| *v > 100), 0);
        cl.verify();

        cl.clear();
        assert_eq!(cl.len(), 0);
        assert!(cl.current().is_none());
        cl.verify();

        drop(cl);
        assert_released();
    }
}
