//! Ghost lists (B1 and B2) - bounded FIFO key histories of evicted entries.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use super::ll::{LLNodeRef, LL};
use crate::hash::RandomState;

pub(crate) struct GhostList<K> {
    index: HashMap<K, LLNodeRef<K>, RandomState>,
    order: LL<K>,
    capacity: usize,
}

impl<K> GhostList<K>
where
    K: Hash + Eq + Clone,
{
    pub(crate) fn new(capacity: usize) -> Self {
        GhostList {
            index: HashMap::default(),
            order: LL::new(),
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        debug_assert_eq!(self.index.len(), self.order.len());
        self.order.len()
    }

    pub(crate) fn contains<Q>(&self, k: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.contains_key(k)
    }

    /// Record `k` as the newest ghost. Going past capacity forgets the oldest
    /// ghost, which is returned.
    pub(crate) fn add(&mut self, k: K) -> Option<K> {
        if let Some(n) = self.index.remove(&k) {
            let _ = LL::free_n(self.order.extract(n));
        }
        let n = self.order.append_k(k.clone());
        self.index.insert(k, n);
        if self.order.len() > self.capacity {
            self.remove_oldest()
        } else {
            None
        }
    }

    pub(crate) fn remove<Q>(&mut self, k: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.index.remove(k) {
            Some(n) => {
                let _ = LL::free_n(self.order.extract(n));
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_oldest(&mut self) -> Option<K> {
        let k = self.order.pop_n_free()?;
        let r = self.index.remove(&k);
        debug_assert!(r.is_some());
        Some(k)
    }

    pub(crate) fn release_where<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let doomed: Vec<K> = self.order.iter().filter(|k| f(*k)).cloned().collect();
        for k in doomed.iter() {
            self.remove(k);
        }
        doomed.len()
    }

    pub(crate) fn clear(&mut self) {
        self.index.clear();
        self.order.clear();
    }

    #[cfg(test)]
    pub(crate) fn keys(&self) -> Vec<K> {
        self.order.iter().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn verify(&self) {
        self.order.verify();
        assert_eq!(self.index.len(), self.order.len());
        assert!(self.order.len() <= self.capacity);
        for k in self.order.iter() {
            let n = self.index.get(k).expect("ghost missing from index");
            assert!(std::ptr::eq(self.order.node(*n), k));
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for GhostList<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.order.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::GhostList;
    use crate::carcache::ll::assert_released;

    #[test]
    fn test_ghost_list_fifo_capacity() {
        let mut gl: GhostList<usize> = GhostList::new(3);
        assert!(gl.add(1).is_none());
        assert!(gl.add(2).is_none());
        assert!(gl.add(3).is_none());
        assert_eq!(gl.len(), 3);
        // Past capacity, the oldest is forgotten.
        assert_eq!(gl.add(4), Some(1));
        assert!(!gl.contains(&1));
        assert_eq!(gl.keys(), vec![2, 3, 4]);
        gl.verify();

        drop(gl);
        assert_released();
    }

    #[test]
    fn test_ghost_list_readd_moves_to_newest() {
        let mut gl: GhostList<usize> = GhostList::new(3);
        gl.add(1);
        gl.add(2);
        gl.add(1);
        assert_eq!(gl.len(), 2);
        assert_eq!(gl.keys(), vec![2, 1]);
        assert_eq!(gl.remove_oldest(), Some(2));
        assert_eq!(gl.remove_oldest(), Some(1));
        assert_eq!(gl.remove_oldest(), None);
        gl.verify();

        drop(gl);
        assert_released();
    }

    #[test]
    fn test_ghost_list_remove_and_release() {
        let mut gl: GhostList<String> = GhostList::new(8);
        for k in ["tenant-a/1", "tenant-b/1", "tenant-a/2", "tenant-c/1"] {
            gl.add(k.to_string());
        }
        assert!(gl.remove("tenant-c/1"));
        assert!(!gl.remove("tenant-c/1"));
        assert_eq!(gl.release_where(|k| k.starts_with("tenant-a/")), 2);
        assert_eq!(gl.keys(), vec!["tenant-b/1".to_string()]);
        assert_eq!(gl.release_where(|_| false), 0);
        gl.verify();

        gl.clear();
        assert_eq!(gl.len(), 0);
        assert_eq!(format!("{:?}", gl), "[]");
        gl.verify();

        drop(gl);
        assert_released();
    }
}
