use std::num::NonZeroUsize;

use concar::carcache::stats::CountStat;
use concar::carcache::{CarCache, CarCacheBuilder, Compute, LockStrategy};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Read(u8),
    Uncacheable(u8),
    Fail(u8),
    Remove(u8),
    ReleaseBelow(u8),
}

fn op() -> impl Strategy<Value = Op> {
    // Mostly reads, over a key space larger than the caches under test.
    prop_oneof![
        8 => any::<u8>().prop_map(|k| Op::Read(k % 48)),
        1 => any::<u8>().prop_map(|k| Op::Uncacheable(k % 48)),
        1 => any::<u8>().prop_map(|k| Op::Fail(k % 48)),
        1 => any::<u8>().prop_map(|k| Op::Remove(k % 48)),
        1 => any::<u8>().prop_map(|k| Op::ReleaseBelow(k % 8)),
    ]
}

fn check_bounds(cache: &CarCache<u8, u32>) {
    let max = cache.max_size();
    assert!(cache.value_count() <= max);
    assert_eq!(cache.value_count(), cache.t1_len() + cache.t2_len());
    assert!(cache.key_count() <= 2 * max);
    assert_eq!(
        cache.key_count(),
        cache.t1_len() + cache.t2_len() + cache.b1_len() + cache.b2_len()
    );
    assert!(cache.p() <= max);
}

fn apply(cache: &CarCache<u8, u32>, op: &Op, stats: &mut CountStat) {
    match *op {
        Op::Read(k) => {
            let v = cache.get_or_compute_stats(k, |k| Compute::<_, ()>::Value(*k as u32 * 3), stats);
            assert_eq!(v.ok(), Some(k as u32 * 3));
            // Whatever just happened, the key is now resident and reads hit.
            assert_eq!(cache.get(&k), Some(k as u32 * 3));
        }
        Op::Uncacheable(k) => {
            let was_resident = cache.contains_key(&k);
            let v = cache.get_or_compute(k, |_| Compute::<u32, ()>::Uncacheable(7));
            if was_resident {
                assert_eq!(v.ok(), Some(k as u32 * 3));
            } else {
                assert_eq!(v.ok(), Some(7));
                assert!(!cache.contains_key(&k));
            }
        }
        Op::Fail(k) => {
            let before = cache.dump_all_lists();
            let was_resident = cache.contains_key(&k);
            let v = cache.get_or_compute(k, |_| Compute::<u32, &str>::Failed("backend down"));
            if was_resident {
                assert!(v.is_ok());
            } else {
                assert_eq!(v.err().map(|e| e.into_inner()), Some("backend down"));
                // A failed producer leaves the lists exactly as they were.
                assert_eq!(cache.dump_all_lists(), before);
            }
        }
        Op::Remove(k) => {
            let _ = cache.remove(&k);
            assert!(!cache.contains_key(&k));
            assert!(!cache.remove(&k));
        }
        Op::ReleaseBelow(m) => {
            let before = cache.key_count();
            let released = cache.release_matching(|k| *k < m);
            assert_eq!(cache.key_count(), before - released);
            for k in 0..m {
                assert!(!cache.contains_key(&k));
            }
        }
    }
}

proptest! {
    #[test]
    fn car_bounds_hold(max in 1usize..16, ops in proptest::collection::vec(op(), 0..256)) {
        let cache: CarCache<u8, u32> = CarCacheBuilder::new()
            .set_size(max)
            .build()
            .expect("Invalid cache parameters!");
        let mut stats = CountStat::default();

        for op in ops.iter() {
            apply(&cache, op, &mut stats);
            check_bounds(&cache);
        }
        prop_assert!(stats.hits <= stats.reads);

        cache.clear();
        prop_assert_eq!(cache.key_count(), 0);
        prop_assert_eq!(cache.p(), 0);
    }

    #[test]
    fn car_sharded_bounds_hold(
        max in 4usize..32,
        shards in 1usize..4,
        ops in proptest::collection::vec(op(), 0..256),
    ) {
        let cache: CarCache<u8, u32> = CarCacheBuilder::new()
            .set_size(max)
            .set_lock_strategy(LockStrategy::Sharded(NonZeroUsize::new(shards).unwrap()))
            .build()
            .expect("Invalid cache parameters!");
        prop_assert_eq!(cache.max_size(), max);
        let mut stats = CountStat::default();

        for op in ops.iter() {
            apply(&cache, op, &mut stats);
            check_bounds(&cache);
        }
    }

    #[test]
    fn car_hits_are_idempotent(keys in proptest::collection::vec(0u8..32, 1..64), probes in 1usize..8) {
        let cache: CarCache<u8, u32> = CarCacheBuilder::new()
            .set_size(8)
            .build()
            .expect("Invalid cache parameters!");
        for k in keys.iter() {
            let _ = cache.get_or_compute(*k, |k| Compute::<_, ()>::Value(*k as u32));
        }

        // Reads of resident keys only set reference flags, so the lists keep
        // their order and membership and p stays put.
        let shape = (cache.t1_len(), cache.t2_len(), cache.b1_len(), cache.b2_len(), cache.p());
        let last = *keys.last().unwrap();
        for _ in 0..probes {
            prop_assert_eq!(cache.get(&last), Some(last as u32));
        }
        prop_assert_eq!(
            (cache.t1_len(), cache.t2_len(), cache.b1_len(), cache.b2_len(), cache.p()),
            shape
        );
        let marked = cache.dump_all_lists();
        prop_assert_eq!(cache.get(&last), Some(last as u32));
        prop_assert_eq!(cache.dump_all_lists(), marked);
    }
}

#[test]
fn car_scan_does_not_flush_frequent_set() {
    let cache: CarCache<u32, u32> = CarCacheBuilder::new()
        .set_size(16)
        .build()
        .expect("Invalid cache parameters!");

    // Establish a hot set that has been seen more than once.
    for _ in 0..4 {
        for k in 0..8 {
            let _ = cache.get_or_compute(k, |k| Compute::<_, ()>::Value(*k));
        }
    }
    // Push enough traffic through to promote the hot set into T2.
    for k in 1000..1016 {
        let _ = cache.get_or_compute(k, |k| Compute::<_, ()>::Value(*k));
        for h in 0..8 {
            let _ = cache.get(&h);
        }
    }
    assert_eq!(cache.t2_len(), 8);

    // A long one-pass scan.
    for k in 2000..2500 {
        let _ = cache.get_or_compute(k, |k| Compute::<_, ()>::Value(*k));
    }
    for k in 0..8 {
        assert!(cache.contains_key(&k), "hot key {} was flushed by a scan", k);
    }
}
