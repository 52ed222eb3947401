use cuckoostripe::{CuckooMap, Error};
use std::collections::BTreeMap;

#[test]
fn shrink_then_overflow_triggers_fast_double() {
    let map = CuckooMap::<u64, u64>::with_capacity(64);
    for i in 1..=4 {
        map.insert(i, i).unwrap();
    }

    // Shrink to a single bucket; all four entries share it.
    assert_eq!(map.rehash(0), Ok(true));
    assert_eq!(map.hashpower(), 0);
    for i in 1..=4 {
        assert_eq!(map.find(&i), Some(i));
    }

    // The bucket is full, so these inserts must grow the table.
    for i in 5..=11 {
        assert_eq!(map.insert(i, i), Ok(true));
    }
    assert!(map.hashpower() >= 1);
    for i in 1..=11 {
        assert_eq!(map.find(&i), Some(i));
    }
    assert_eq!(map.len(), 11);
}

#[test]
fn maximum_hashpower_blocks_growth_and_preserves_entries() {
    // Two buckets of four slots, and growth pinned at the current size.
    let map = CuckooMap::<u64, u64>::with_capacity(8);
    assert_eq!(map.hashpower(), 1);
    map.set_maximum_hashpower(1);

    // Fill until placement fails; at most eight entries can ever fit.
    let mut inserted = Vec::new();
    let mut failure = None;
    for i in 0..64 {
        match map.insert(i, i * 10) {
            Ok(true) => inserted.push(i),
            Ok(false) => unreachable!("keys are distinct"),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    assert_eq!(
        failure,
        Some(Error::MaximumHashpowerExceeded { hashpower: 2 })
    );
    assert!(inserted.len() <= 8);

    // The failure left the table fully intact.
    assert_eq!(map.hashpower(), 1);
    assert_eq!(map.len(), inserted.len());
    for i in &inserted {
        assert_eq!(map.find(i), Some(i * 10));
    }
}

#[test]
fn explicit_rehash_past_maximum_fails_cleanly() {
    let map = CuckooMap::<u64, u64>::with_capacity(64);
    for i in 0..32 {
        map.insert(i, i).unwrap();
    }
    let hashpower = map.hashpower();
    map.set_maximum_hashpower(hashpower);

    assert_eq!(
        map.rehash(hashpower + 1),
        Err(Error::MaximumHashpowerExceeded {
            hashpower: hashpower + 1
        })
    );
    assert_eq!(map.hashpower(), hashpower);
    assert_eq!(map.len(), 32);
    for i in 0..32 {
        assert_eq!(map.find(&i), Some(i));
    }
}

#[test]
fn rehash_round_trip_preserves_entries() {
    let map = CuckooMap::<u64, u64>::with_capacity(256);
    let mut model = BTreeMap::new();
    for i in 0..200u64 {
        let key = i.wrapping_mul(0x9e3779b97f4a7c15);
        map.insert(key, i).unwrap();
        model.insert(key, i);
    }
    let hashpower = map.hashpower();

    assert_eq!(map.rehash(hashpower + 2), Ok(true));
    assert_eq!(map.hashpower(), hashpower + 2);
    assert_eq!(map.rehash(hashpower), Ok(true));
    assert_eq!(map.hashpower(), hashpower);

    assert_eq!(map.len(), model.len());
    let table = map.lock_table();
    let mut found = BTreeMap::new();
    for (k, v) in table.iter() {
        assert!(found.insert(*k, *v).is_none(), "duplicate key in iteration");
    }
    assert_eq!(found, model);
}

#[test]
fn shrink_clamps_to_fit_contents() {
    let map = CuckooMap::<u64, u64>::with_capacity(1024);
    for i in 0..100 {
        map.insert(i, i).unwrap();
    }
    // 100 entries cannot fit in a hashpower-0 table; the resize clamps.
    map.rehash(0).unwrap();
    assert!(map.capacity() >= 100);
    assert_eq!(map.len(), 100);
    for i in 0..100 {
        assert_eq!(map.find(&i), Some(i));
    }
}

#[test]
fn reserve_grows_and_shrinks() {
    let map = CuckooMap::<u64, u64>::with_capacity(8);
    let small = map.bucket_count();

    assert_eq!(map.reserve(10_000), Ok(true));
    assert!(map.capacity() >= 10_000);

    assert_eq!(map.reserve(8), Ok(true));
    assert_eq!(map.bucket_count(), small);

    // Reserving the current size is a no-op.
    assert_eq!(map.reserve(8), Ok(false));
}

#[test]
fn concurrent_grow_paths() {
    let map = CuckooMap::<u64, u64>::with_capacity(8);
    for i in 0..8 {
        map.insert(i, i).unwrap();
    }
    let hashpower = map.hashpower();

    assert_eq!(map.rehash_concurrent(hashpower + 3), Ok(true));
    assert_eq!(map.hashpower(), hashpower + 3);
    // Not larger than current: no-op.
    assert_eq!(map.rehash_concurrent(hashpower), Ok(false));

    assert_eq!(map.reserve_concurrent(1 << 12), Ok(true));
    assert!(map.capacity() >= 1 << 12);

    for i in 0..8 {
        assert_eq!(map.find(&i), Some(i));
    }
}

#[test]
fn growth_across_many_doublings_keeps_all_entries() {
    // Start tiny and insert enough to force repeated automatic doublings.
    let map = CuckooMap::<u64, u64>::with_capacity(4);
    const N: u64 = 100_000;
    for i in 0..N {
        map.insert(i, !i).unwrap();
    }
    assert_eq!(map.len(), N as usize);
    for i in (0..N).step_by(97) {
        assert_eq!(map.find(&i), Some(!i));
    }
}

#[test]
fn worker_threads_rehash_under_locked_table() {
    let map = CuckooMap::<u64, u64>::with_capacity(64);
    map.set_max_num_worker_threads(3);
    for i in 0..1000 {
        map.insert(i, i).unwrap();
    }

    let mut table = map.lock_table();
    table.rehash(12).unwrap();
    assert_eq!(table.hashpower(), 12);
    assert_eq!(table.len(), 1000);
    drop(table);

    for i in 0..1000 {
        assert_eq!(map.find(&i), Some(i));
    }
}

#[test]
fn locked_table_snapshot_matches_prior_view() {
    let map = CuckooMap::<u64, u64>::with_capacity(128);
    let mut expected = BTreeMap::new();
    for i in 0..100u64 {
        let key = i * 31 + 7;
        map.insert(key, i).unwrap();
        expected.insert(key, i);
    }

    let table = map.lock_table();
    let snapshot: BTreeMap<u64, u64> = table.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(snapshot, expected);
}

#[test]
fn load_factor_floor_rejects_sparse_automatic_growth() {
    use cuckoostripe::internal::partial_key;
    use cuckoostripe::IdentityHasher;
    use std::hash::BuildHasherDefault;

    // IdentityHasher makes the key its own hash, so we can build adversarial
    // keys: same primary bucket, same partial (hence the same alternate
    // bucket), but distinct hashes. Nine of them overflow one bucket pair
    // while the rest of the table is empty.
    let map: CuckooMap<u64, u64, BuildHasherDefault<IdentityHasher>> =
        CuckooMap::with_capacity_and_hasher(1 << 10, Default::default());
    let hashpower = map.hashpower();
    let buckets = 1u64 << hashpower;

    const BASE: u64 = 5;
    let target_partial = partial_key(BASE as usize);
    let colliders: Vec<u64> = (0..)
        .map(|j| BASE + j * buckets)
        .filter(|k| partial_key(*k as usize) == target_partial)
        .take(9)
        .collect();

    for key in &colliders[..8] {
        assert_eq!(map.insert(*key, 1), Ok(true));
    }
    // The ninth collider forces a doubling of a nearly empty table, which
    // the load factor floor rejects.
    assert!(matches!(
        map.insert(colliders[8], 1),
        Err(Error::LoadFactorTooLow { .. })
    ));
    assert_eq!(map.hashpower(), hashpower);
    assert_eq!(map.len(), 8);
    for key in &colliders[..8] {
        assert_eq!(map.find(key), Some(1));
    }

    // Dropping the floor lets the same insert grow the table and succeed.
    map.set_minimum_load_factor(0.0);
    assert_eq!(map.insert(colliders[8], 1), Ok(true));
    assert_eq!(map.len(), 9);
}
