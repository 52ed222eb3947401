//! Module for the exclusive-ownership view of a [`CuckooMap`], which holds
//! every lock stripe and in exchange can iterate and resize without lock
//! thrashing.

use crate::bucket::BucketContainer;
use crate::cuckoomap::{AllLocksGuard, CuckooMap, TableMode};
use crate::Error;
use std::alloc::Allocator;
use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash};

/// An ownership wrapper around a [`CuckooMap`]. Creating one takes every
/// lock stripe, blocking all concurrent operations on the map, and completes
/// any outstanding lazy migrations (using the worker pool). In exchange the
/// handle can offer operations that are impossible in a concurrent context:
/// iteration, coherent whole-table reads, and in-place references.
///
/// Dropping the handle (or calling [`LockedTable::unlock`]) releases every
/// stripe. After an explicit unlock the handle is inactive and the data
/// operations panic.
///
/// # Examples
///
/// ```
/// use cuckoostripe::CuckooMap;
///
/// let map = CuckooMap::with_capacity(16);
/// map.insert(1, 10).unwrap();
/// map.insert(2, 20).unwrap();
///
/// let table = map.lock_table();
/// let mut total = 0;
/// for (_, value) in table.iter() {
///     total += value;
/// }
/// assert_eq!(total, 30);
/// ```
pub struct LockedTable<'a, K, V, H, A: Allocator, const S: usize> {
    map: &'a CuckooMap<K, V, H, A, S>,
    all_locks: Option<AllLocksGuard<'a, A>>,
}

impl<'a, K, V, H, A, const S: usize> LockedTable<'a, K, V, H, A, S>
where
    K: Eq + Hash + Send + Sync,
    V: Send + Sync,
    H: BuildHasher + Sync,
    A: Allocator + Sync,
{
    pub(crate) fn new(map: &'a CuckooMap<K, V, H, A, S>) -> Self {
        let all_locks = map.lock_all(TableMode::Normal);
        // Complete every outstanding migration so the bucket container can
        // be read without consulting the stripes.
        map.rehash_with_workers();
        LockedTable {
            map,
            all_locks: Some(all_locks),
        }
    }

    /// Inserts `key` and `value` if `key` is absent. Returns `Ok(true)` if a
    /// new entry was inserted. Insertion may displace other entries or grow
    /// the table, so it invalidates any previously observed positions.
    ///
    /// # Panics
    ///
    /// Panics if the handle has been unlocked.
    pub fn insert(&mut self, key: K, value: V) -> Result<bool, Error> {
        self.assert_active();
        let hv = self.map.hashed_key(&key);
        let mut buckets = self.map.snapshot_and_lock_two(hv, TableMode::Locked);
        let pos = self
            .map
            .cuckoo_insert_loop(hv, &mut buckets, &key, TableMode::Locked)?;
        if pos.is_vacancy() {
            // SAFETY: the position is an empty slot and this handle holds
            // every stripe.
            unsafe {
                self.map
                    .add_to_bucket(pos.index, pos.slot, hv.partial, key, value)
            };
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Removes every element.
    ///
    /// # Panics
    ///
    /// Panics if the handle has been unlocked.
    pub fn clear(&mut self) {
        self.assert_active();
        // SAFETY: this handle holds every stripe.
        unsafe { self.map.cuckoo_clear() };
    }

    /// Resizes the table to the given hashpower, exactly as
    /// [`CuckooMap::rehash`] but without re-taking any locks.
    ///
    /// # Panics
    ///
    /// Panics if the handle has been unlocked.
    pub fn rehash(&mut self, hashpower: usize) -> Result<bool, Error> {
        self.assert_active();
        if hashpower == self.map.hashpower() {
            return Ok(false);
        }
        self.map
            .cuckoo_change_capacity(hashpower, TableMode::Locked)
    }

    /// Reserves space for `n` elements, exactly as [`CuckooMap::reserve`]
    /// but without re-taking any locks.
    ///
    /// # Panics
    ///
    /// Panics if the handle has been unlocked.
    pub fn reserve(&mut self, n: usize) -> Result<bool, Error> {
        self.assert_active();
        let new_hashpower = crate::cuckoomap::reserve_calc::<S>(n);
        if new_hashpower == self.map.hashpower() {
            return Ok(false);
        }
        self.map
            .cuckoo_change_capacity(new_hashpower, TableMode::Locked)
    }
}

impl<'a, K, V, H, A, const S: usize> LockedTable<'a, K, V, H, A, S>
where
    K: Eq + Hash,
    H: BuildHasher,
    A: Allocator,
{
    /// Returns true if the handle still owns the table's stripes.
    pub fn is_active(&self) -> bool {
        self.all_locks.is_some()
    }

    /// Releases every stripe, making the handle inactive. Idempotent.
    pub fn unlock(&mut self) {
        self.all_locks = None;
    }

    fn assert_active(&self) {
        assert!(self.is_active(), "the locked table has been unlocked");
    }

    /// Returns log2 of the number of buckets.
    pub fn hashpower(&self) -> usize {
        self.map.hashpower()
    }

    /// Returns the number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.map.bucket_count()
    }

    /// Returns the number of slots in the table.
    pub fn capacity(&self) -> usize {
        self.map.capacity()
    }

    /// Returns the number of elements in the table.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if the table holds no elements.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the fraction of slots holding an element.
    pub fn load_factor(&self) -> f64 {
        self.map.load_factor()
    }

    /// Returns a reference to the value associated with `key`.
    ///
    /// # Panics
    ///
    /// Panics if the handle has been unlocked.
    pub fn find<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.assert_active();
        let hv = self.map.hashed_key(key);
        let buckets = self.map.snapshot_and_lock_two(hv, TableMode::Locked);
        self.map
            .cuckoo_find(key, hv.partial, buckets.i1, buckets.i2)
            .map(|(index, slot)| {
                // SAFETY: the slot is occupied and this handle holds every
                // stripe for as long as the reference can live.
                unsafe { self.map.buckets().bucket(index).value(slot) }
            })
    }

    /// Returns a mutable reference to the value associated with `key`.
    ///
    /// # Panics
    ///
    /// Panics if the handle has been unlocked.
    pub fn find_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.assert_active();
        let hv = self.map.hashed_key(key);
        let buckets = self.map.snapshot_and_lock_two(hv, TableMode::Locked);
        self.map
            .cuckoo_find(key, hv.partial, buckets.i1, buckets.i2)
            .map(|(index, slot)| {
                // SAFETY: as in find, and the &mut self receiver makes this
                // the only live reference into the table.
                unsafe { self.map.buckets().bucket(index).value_mut(slot) }
            })
    }

    /// Returns true if the table contains `key`.
    ///
    /// # Panics
    ///
    /// Panics if the handle has been unlocked.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find(key).is_some()
    }

    /// Erases `key` from the table. Returns true if it was present.
    ///
    /// # Panics
    ///
    /// Panics if the handle has been unlocked.
    pub fn erase<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.assert_active();
        let hv = self.map.hashed_key(key);
        let buckets = self.map.snapshot_and_lock_two(hv, TableMode::Locked);
        match self
            .map
            .cuckoo_find(key, hv.partial, buckets.i1, buckets.i2)
        {
            Some((index, slot)) => {
                // SAFETY: the slot is occupied and every stripe is held.
                unsafe { self.map.del_from_bucket(index, slot) };
                true
            }
            None => false,
        }
    }

    /// Returns an iterator over the table's entries.
    ///
    /// # Panics
    ///
    /// Panics if the handle has been unlocked.
    pub fn iter(&self) -> Iter<'_, K, V, A, S> {
        self.assert_active();
        Iter::new(self.map.buckets())
    }

    /// Returns an iterator over the table's entries with mutable access to
    /// the values.
    ///
    /// # Panics
    ///
    /// Panics if the handle has been unlocked.
    pub fn iter_mut(&mut self) -> IterMut<'_, K, V, A, S> {
        self.assert_active();
        IterMut::new(self.map.buckets())
    }
}

impl<'a, 't, K, V, H, A, const S: usize> IntoIterator for &'t LockedTable<'a, K, V, H, A, S>
where
    K: Eq + Hash,
    H: BuildHasher,
    A: Allocator,
{
    type Item = (&'t K, &'t V);
    type IntoIter = Iter<'t, K, V, A, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, 't, K, V, H, A, const S: usize> IntoIterator for &'t mut LockedTable<'a, K, V, H, A, S>
where
    K: Eq + Hash,
    H: BuildHasher,
    A: Allocator,
{
    type Item = (&'t K, &'t mut V);
    type IntoIter = IterMut<'t, K, V, A, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

/// An iterator over the entries of a [`LockedTable`], in bucket-then-slot
/// order, skipping unoccupied slots. Double-ended.
pub struct Iter<'t, K, V, A: Allocator, const S: usize> {
    buckets: &'t BucketContainer<K, V, A, S>,
    /// Next linearized (bucket * S + slot) position to try from the front.
    front: usize,
    /// One past the last linearized position to try from the back.
    back: usize,
}

impl<'t, K, V, A: Allocator, const S: usize> Iter<'t, K, V, A, S> {
    fn new(buckets: &'t BucketContainer<K, V, A, S>) -> Self {
        let back = buckets.len() * S;
        Iter {
            buckets,
            front: 0,
            back,
        }
    }
}

impl<'t, K, V, A: Allocator, const S: usize> Iterator for Iter<'t, K, V, A, S> {
    type Item = (&'t K, &'t V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.front < self.back {
            let (index, slot) = (self.front / S, self.front % S);
            self.front += 1;
            let bucket = self.buckets.bucket(index);
            if bucket.occupied(slot) {
                // SAFETY: the slot is occupied and the owning LockedTable
                // holds every stripe for the iterator's lifetime.
                return Some(unsafe { (bucket.key(slot), bucket.value(slot)) });
            }
        }
        None
    }
}

impl<'t, K, V, A: Allocator, const S: usize> DoubleEndedIterator for Iter<'t, K, V, A, S> {
    fn next_back(&mut self) -> Option<Self::Item> {
        while self.back > self.front {
            self.back -= 1;
            let (index, slot) = (self.back / S, self.back % S);
            let bucket = self.buckets.bucket(index);
            if bucket.occupied(slot) {
                // SAFETY: as in next.
                return Some(unsafe { (bucket.key(slot), bucket.value(slot)) });
            }
        }
        None
    }
}

/// An iterator over the entries of a [`LockedTable`] yielding mutable value
/// references. Double-ended.
pub struct IterMut<'t, K, V, A: Allocator, const S: usize> {
    buckets: &'t BucketContainer<K, V, A, S>,
    front: usize,
    back: usize,
}

impl<'t, K, V, A: Allocator, const S: usize> IterMut<'t, K, V, A, S> {
    fn new(buckets: &'t BucketContainer<K, V, A, S>) -> Self {
        let back = buckets.len() * S;
        IterMut {
            buckets,
            front: 0,
            back,
        }
    }
}

impl<'t, K, V, A: Allocator, const S: usize> Iterator for IterMut<'t, K, V, A, S> {
    type Item = (&'t K, &'t mut V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.front < self.back {
            let (index, slot) = (self.front / S, self.front % S);
            self.front += 1;
            let bucket = self.buckets.bucket(index);
            if bucket.occupied(slot) {
                // SAFETY: the slot is occupied, the owning LockedTable was
                // borrowed mutably to create this iterator, and each slot is
                // visited at most once, so the yielded references never
                // alias.
                return Some(unsafe { (bucket.key(slot), bucket.value_mut(slot)) });
            }
        }
        None
    }
}

impl<'t, K, V, A: Allocator, const S: usize> DoubleEndedIterator for IterMut<'t, K, V, A, S> {
    fn next_back(&mut self) -> Option<Self::Item> {
        while self.back > self.front {
            self.back -= 1;
            let (index, slot) = (self.back / S, self.back % S);
            let bucket = self.buckets.bucket(index);
            if bucket.occupied(slot) {
                // SAFETY: as in next.
                return Some(unsafe { (bucket.key(slot), bucket.value_mut(slot)) });
            }
        }
        None
    }
}
