//==------------------------------------------------------------------------==//
//                                cuckoostripe
//      This file is distributed under the APACHE License, Version 2.0.
//                         See LICENSE for details.
//==------------------------------------------------------------------------==//

//! Module for a concurrent hash map which uses partial-key cuckoo hashing
//! with striped sequence locks and lazy incremental rehashing.

use crate::bucket::{Bucket, BucketContainer};
use crate::locked_table::LockedTable;
use crate::stripe::{Stripe, StripeArray, MAX_NUM_STRIPES, MAX_NUM_STRIPES_POW};
use crate::util::round_to_pow2;
use crate::{hash_one, Error};
use atomic::Atomic;
use log::debug;
use std::alloc::{Allocator, Global};
use std::borrow::Borrow;
use std::fmt;
use std::hash::{BuildHasher, BuildHasherDefault, Hash};
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

/// The default hasher for a [`CuckooMap`].
pub(crate) type DefaultHash = std::collections::hash_map::DefaultHasher;

/// The default number of slots per bucket.
pub const DEFAULT_SLOT_PER_BUCKET: usize = 4;

/// The default number of elements a map created with [`CuckooMap::new`]
/// reserves space for.
pub const DEFAULT_SIZE: usize = (1 << 16) * DEFAULT_SLOT_PER_BUCKET;

/// The default minimum load factor for automatic expansions.
pub const DEFAULT_MINIMUM_LOAD_FACTOR: f64 = 0.05;

/// Sentinel meaning that no maximum hashpower is enforced.
pub const NO_MAXIMUM_HASHPOWER: usize = usize::MAX;

/// The maximum number of slots along a BFS cuckoo path.
const MAX_BFS_PATH_LEN: usize = 5;

/// The hash constant from 64-bit MurmurHash2, used to derive the alternate
/// bucket index from the partial key.
const ALT_INDEX_MULTIPLIER: u64 = 0xc6a4a7935bd1e995;

/// A hash of a key together with its one-byte partial key.
#[derive(Clone, Copy)]
pub(crate) struct HashValue {
    pub(crate) hash: usize,
    pub(crate) partial: u8,
}

/// The number of buckets for the given hashpower.
#[inline]
pub(crate) fn hashsize(hashpower: usize) -> usize {
    1 << hashpower
}

/// The bucket index mask for the given hashpower.
#[inline]
pub(crate) fn hashmask(hashpower: usize) -> usize {
    hashsize(hashpower) - 1
}

/// Folds a hash down to the one-byte partial key.
///
/// The partial key depends only on the hash, never on the hashpower. This is
/// load-bearing: table doubling adds exactly one bit at the top of both
/// bucket indices, which is what lets a doubled table migrate each entry to
/// either its old index or its old index plus the old bucket count.
#[doc(hidden)]
#[inline]
pub fn partial_key(hash: usize) -> u8 {
    let hash64 = hash as u64;
    let hash32 = (hash64 as u32) ^ ((hash64 >> 32) as u32);
    let hash16 = (hash32 as u16) ^ ((hash32 >> 16) as u16);
    (hash16 as u8) ^ ((hash16 >> 8) as u8)
}

/// The first candidate bucket for a hashed key.
#[doc(hidden)]
#[inline]
pub fn index_hash(hashpower: usize, hash: usize) -> usize {
    hash & hashmask(hashpower)
}

/// The other candidate bucket for a hashed key, given either candidate.
///
/// This is an involution for a fixed hashpower and partial:
/// `alt_index(hp, p, alt_index(hp, p, i)) == i`.
#[doc(hidden)]
#[inline]
pub fn alt_index(hashpower: usize, partial: u8, index: usize) -> usize {
    // Ensure the tag is nonzero for the multiply.
    let nonzero_tag = partial as usize + 1;
    (index ^ nonzero_tag.wrapping_mul(ALT_INDEX_MULTIPLIER as usize)) & hashmask(hashpower)
}

/// Converts a bucket index into a stripe index. The mask is a constant so
/// that a bucket keeps its stripe across every table doubling.
#[inline]
pub(crate) fn lock_ind(bucket: usize) -> usize {
    bucket & (MAX_NUM_STRIPES - 1)
}

/// The smallest hashpower whose table holds `n` elements with `S` slots per
/// bucket.
#[doc(hidden)]
pub fn reserve_calc<const S: usize>(n: usize) -> usize {
    let buckets = n.div_ceil(S).max(1);
    round_to_pow2(buckets).trailing_zeros() as usize
}

/// True if keys are small and trivially destructible, in which case the
/// partial-key filter costs more than the direct comparison it avoids.
const fn is_simple<K>() -> bool {
    std::mem::size_of::<K>() <= 8 && !std::mem::needs_drop::<K>()
}

const fn const_pow(a: usize, b: usize) -> usize {
    if b == 0 {
        1
    } else {
        a * const_pow(a, b - 1)
    }
}

/// The BFS queue holds just enough slots to complete a full search from two
/// starting buckets with no wrap-around: twice the geometric sum
/// `sum_{k=0}^{MAX_BFS_PATH_LEN-1} S^k`.
const fn max_cuckoo_count(slots: usize) -> usize {
    if slots == 1 {
        2 * MAX_BFS_PATH_LEN
    } else {
        2 * (const_pow(slots, MAX_BFS_PATH_LEN) - 1) / (slots - 1)
    }
}

// Status codes for the internal placement functions.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CuckooStatus {
    Ok,
    KeyDuplicated,
    TableFull,
    UnderExpansion,
}

/// Retry signal returned by the locking helpers when the table was resized
/// between computing bucket indices and acquiring their stripes.
struct HashpowerChanged;

/// Whether the caller already holds every stripe (locked-table mode) or the
/// stripes must be taken per operation.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum TableMode {
    Normal,
    Locked,
}

/// Whether a resize was triggered automatically by a failed insert or
/// explicitly by the caller. Only automatic resizes enforce the minimum load
/// factor.
#[derive(Clone, Copy, PartialEq, Eq)]
enum ResizeKind {
    Automatic,
    Manual,
}

/// How bucket migration maintains the per-stripe element counters.
#[derive(Clone, Copy, PartialEq, Eq)]
enum CounterPolicy {
    /// Source and destination bucket share a stripe, so the counters cannot
    /// change. This is always the case during lazy migration, where the
    /// destination index differs from the source by a multiple of the stripe
    /// count.
    Keep,
    /// Transfer the count from the source bucket's stripe to the destination
    /// bucket's stripe (the eager small-table doubling path).
    Transfer,
}

/// A position in the table returned by the placement functions.
#[derive(Clone, Copy)]
pub(crate) struct TablePosition {
    pub(crate) index: usize,
    pub(crate) slot: usize,
    status: CuckooStatus,
}

impl TablePosition {
    /// True if the position refers to an empty slot ready for insertion,
    /// false if it refers to an existing entry with the same key.
    pub(crate) fn is_vacancy(&self) -> bool {
        self.status == CuckooStatus::Ok
    }
}

/// Scoped ownership of a single stripe; releases on drop.
struct LockGuard<'a> {
    stripe: Option<&'a Stripe>,
    modified: bool,
}

impl<'a> LockGuard<'a> {
    fn inactive() -> Self {
        LockGuard {
            stripe: None,
            modified: false,
        }
    }
}

impl<'a> Drop for LockGuard<'a> {
    fn drop(&mut self) {
        if let Some(stripe) = self.stripe.take() {
            if self.modified {
                stripe.unlock();
            } else {
                stripe.unlock_no_modified();
            }
        }
    }
}

/// Scoped ownership of the one or two stripes covering a key's candidate
/// buckets. Dropping releases with an epoch advance; the read-only paths
/// release explicitly without one.
pub(crate) struct TwoBuckets<'a> {
    pub(crate) i1: usize,
    pub(crate) i2: usize,
    lock1: Option<&'a Stripe>,
    lock2: Option<&'a Stripe>,
}

impl<'a> TwoBuckets<'a> {
    fn inactive(i1: usize, i2: usize) -> Self {
        TwoBuckets {
            i1,
            i2,
            lock1: None,
            lock2: None,
        }
    }

    /// Releases the held stripes, advancing their epochs.
    pub(crate) fn unlock(&mut self) {
        if let Some(stripe) = self.lock1.take() {
            stripe.unlock();
        }
        if let Some(stripe) = self.lock2.take() {
            stripe.unlock();
        }
    }

    /// Releases the held stripes without advancing their epochs.
    pub(crate) fn unlock_no_modified(&mut self) {
        if let Some(stripe) = self.lock1.take() {
            stripe.unlock_no_modified();
        }
        if let Some(stripe) = self.lock2.take() {
            stripe.unlock_no_modified();
        }
    }
}

impl<'a> Drop for TwoBuckets<'a> {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Scoped ownership of every stripe in the table.
///
/// The count is re-read at release time: the stripe array may have grown
/// while all stripes were held, and the new stripes are created held so that
/// this guard releases them together with the rest.
pub(crate) struct AllLocksGuard<'a, A: Allocator> {
    stripes: Option<&'a StripeArray<A>>,
}

impl<'a, A: Allocator> Drop for AllLocksGuard<'a, A> {
    fn drop(&mut self) {
        if let Some(stripes) = self.stripes.take() {
            for l in 0..stripes.len() {
                stripes.stripe(l).unlock();
            }
        }
    }
}

// One position along a cuckoo path. Path elements only pin down a sequence of
// alternate hashings, so the hash values being displaced are recorded rather
// than the keys themselves.
#[derive(Clone, Copy)]
struct CuckooRecord {
    bucket: usize,
    slot: usize,
    hv: HashValue,
}

const EMPTY_RECORD: CuckooRecord = CuckooRecord {
    bucket: 0,
    slot: 0,
    hv: HashValue {
        hash: 0,
        partial: 0,
    },
};

// A node in the BFS over candidate buckets: the bucket at the end of the
// path, a base-S encoding of the slot choices along it, and its depth.
#[derive(Clone, Copy)]
struct BSlot {
    bucket: usize,
    pathcode: u16,
    depth: i8,
}

// The queue used for BFS cuckoo path search. Its capacity is exactly the
// number of nodes a full-depth search can enqueue, so it never wraps.
struct BQueue {
    slots: Vec<BSlot>,
    first: usize,
}

impl BQueue {
    fn new(capacity: usize) -> Self {
        BQueue {
            slots: Vec::with_capacity(capacity),
            first: 0,
        }
    }

    fn enqueue(&mut self, slot: BSlot) {
        debug_assert!(self.slots.len() < self.slots.capacity());
        self.slots.push(slot);
    }

    fn dequeue(&mut self) -> BSlot {
        debug_assert!(self.first < self.slots.len());
        let slot = self.slots[self.first];
        self.first += 1;
        slot
    }

    fn is_empty(&self) -> bool {
        self.first == self.slots.len()
    }
}

/// A concurrent hash map based on partial-key cuckoo hashing.
///
/// Every key hashes to two candidate buckets of `SLOT_PER_BUCKET` slots each,
/// derived so that the table can double in place: doubling adds exactly one
/// bit at the top of each candidate index, meaning an entry either stays put
/// or moves up by exactly the old bucket count. That structure is what makes
/// *lazy* migration possible: after a doubling, each lock stripe carries a
/// "migrated" bit, and the first writer (or reader) to touch a stale stripe
/// moves just that stripe's entries before proceeding.
///
/// Writers take one or two of the `2^16` lock stripes (in stripe order, to
/// preclude deadlock); when both candidate buckets are full, a breadth-first
/// search finds a short chain of displacements to free a slot. Readers take
/// no locks at all: they sample the stripe epochs, read the bucket data, and
/// accept the result only if the epochs are unchanged, even, and migrated
/// (the classical optimistic seqlock pattern). Because of that staging
/// protocol, the read-side operations require `V: Clone`.
///
/// The map is unsuitable for iteration under concurrent mutation; call
/// [`CuckooMap::lock_table`] to obtain an exclusive [`LockedTable`] handle
/// which exposes iterators and whole-table operations.
///
/// # Examples
///
/// ```
/// use cuckoostripe::CuckooMap;
///
/// let map = CuckooMap::with_capacity(16);
/// assert_eq!(map.insert(7, "seven"), Ok(true));
/// assert_eq!(map.insert(7, "again"), Ok(false));
/// assert_eq!(map.find(&7), Some("seven"));
/// assert!(map.erase(&7));
/// assert_eq!(map.find(&7), None);
/// ```
pub struct CuckooMap<
    K,
    V,
    H = BuildHasherDefault<DefaultHash>,
    A: Allocator = Global,
    const SLOT_PER_BUCKET: usize = DEFAULT_SLOT_PER_BUCKET,
> {
    /// The hasher for the map.
    hash_builder: H,
    /// Bucket storage. Only mutated while holding the covering stripes, or
    /// every stripe for structural changes.
    buckets: BucketContainer<K, V, A, SLOT_PER_BUCKET>,
    /// The lock stripes. Grown (never shrunk) while the table has fewer
    /// buckets than the stripe ceiling.
    stripes: StripeArray<A>,
    /// Load factor below which an automatic expansion fails instead of
    /// doubling, to surface adversarial keys or a poor hash function.
    minimum_load_factor: Atomic<f64>,
    /// Hashpower ceiling for any expansion; `NO_MAXIMUM_HASHPOWER` disables.
    maximum_hashpower: AtomicUsize,
    /// Extra threads large batch operations may spawn.
    max_num_worker_threads: AtomicUsize,
}

impl<K, V> CuckooMap<K, V, BuildHasherDefault<DefaultHash>, Global, DEFAULT_SLOT_PER_BUCKET>
where
    K: Eq + Hash,
{
    /// Creates a map reserving space for [`DEFAULT_SIZE`] elements.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SIZE)
    }

    /// Creates a map reserving space for `capacity` elements.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher_in(capacity, Default::default(), Global)
    }
}

impl<K, V, H> CuckooMap<K, V, H, Global, DEFAULT_SLOT_PER_BUCKET>
where
    K: Eq + Hash,
    H: BuildHasher,
{
    /// Creates a map with the given hasher builder.
    pub fn with_hasher(builder: H) -> Self {
        Self::with_capacity_and_hasher(DEFAULT_SIZE, builder)
    }

    /// Creates a map reserving space for `capacity` elements, with the given
    /// hasher builder.
    pub fn with_capacity_and_hasher(capacity: usize, builder: H) -> Self {
        Self::with_capacity_and_hasher_in(capacity, builder, Global)
    }
}

impl<K, V, H, A, const S: usize> Default for CuckooMap<K, V, H, A, S>
where
    K: Eq + Hash,
    H: BuildHasher + Default,
    A: Allocator + Clone + Default,
{
    fn default() -> Self {
        Self::with_capacity_and_hasher_in(DEFAULT_SIZE, H::default(), A::default())
    }
}

impl<K, V, H, A, const S: usize> CuckooMap<K, V, H, A, S>
where
    K: Eq + Hash,
    H: BuildHasher,
    A: Allocator + Clone,
{
    /// Creates a map using the provided allocator.
    pub fn new_in(alloc: A) -> Self
    where
        H: Default,
    {
        Self::with_capacity_and_hasher_in(DEFAULT_SIZE, H::default(), alloc)
    }

    /// Creates a map reserving space for `capacity` elements, with the given
    /// hasher builder, using the provided allocator.
    pub fn with_capacity_and_hasher_in(capacity: usize, builder: H, alloc: A) -> Self {
        let hashpower = reserve_calc::<S>(capacity);
        let stripe_power = hashpower.min(MAX_NUM_STRIPES_POW);
        CuckooMap {
            hash_builder: builder,
            buckets: BucketContainer::new(hashpower, alloc.clone()),
            stripes: StripeArray::new(stripe_power, alloc),
            minimum_load_factor: Atomic::new(DEFAULT_MINIMUM_LOAD_FACTOR),
            maximum_hashpower: AtomicUsize::new(NO_MAXIMUM_HASHPOWER),
            max_num_worker_threads: AtomicUsize::new(0),
        }
    }
}

// Table details. These query changing properties of the table without
// synchronizing against concurrent operations, so they may return slightly
// out-of-date information while the table is being modified.
impl<K, V, H, A: Allocator, const S: usize> CuckooMap<K, V, H, A, S> {
    /// The number of slots per bucket.
    pub const fn slot_per_bucket() -> usize {
        S
    }

    /// Returns a reference to the map's hasher builder.
    pub fn hasher(&self) -> &H {
        &self.hash_builder
    }

    /// Returns log2 of the number of buckets.
    pub fn hashpower(&self) -> usize {
        self.buckets.hashpower()
    }

    /// Returns the number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Returns the number of slots, that is, `bucket_count() *
    /// slot_per_bucket()`.
    pub fn capacity(&self) -> usize {
        self.bucket_count() * S
    }

    /// Returns the number of elements in the map, summed over the stripe
    /// counters. Exact whenever the table is quiescent.
    pub fn len(&self) -> usize {
        let mut total: i64 = 0;
        for l in 0..self.stripes.len() {
            total += self.stripes.stripe(l).elems();
        }
        debug_assert!(total >= 0);
        total.max(0) as usize
    }

    /// Returns true if the map holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the fraction of slots holding an element.
    pub fn load_factor(&self) -> f64 {
        self.len() as f64 / self.capacity() as f64
    }

    /// Returns the minimum load factor enforced on automatic expansions.
    pub fn minimum_load_factor(&self) -> f64 {
        self.minimum_load_factor.load(Ordering::Acquire)
    }

    /// Sets the minimum load factor for automatic expansions. An automatic
    /// expansion requested while the table is emptier than this fraction
    /// fails with [`Error::LoadFactorTooLow`], which usually means the hash
    /// function is weak or the keys are adversarial.
    ///
    /// # Panics
    ///
    /// Panics if `mlf` is not within `[0.0, 1.0]`.
    pub fn set_minimum_load_factor(&self, mlf: f64) {
        assert!(
            (0.0..=1.0).contains(&mlf),
            "load factor {mlf} must be within [0.0, 1.0]",
        );
        self.minimum_load_factor.store(mlf, Ordering::Release);
    }

    /// Returns the maximum hashpower the table may grow to.
    pub fn maximum_hashpower(&self) -> usize {
        self.maximum_hashpower.load(Ordering::Acquire)
    }

    /// Sets the maximum hashpower the table may grow to, or
    /// [`NO_MAXIMUM_HASHPOWER`] for no limit.
    ///
    /// # Panics
    ///
    /// Panics if the current hashpower already exceeds `mhp`.
    pub fn set_maximum_hashpower(&self, mhp: usize) {
        assert!(
            self.hashpower() <= mhp,
            "maximum hashpower {mhp} is less than the current hashpower",
        );
        self.maximum_hashpower.store(mhp, Ordering::Release);
    }

    /// Returns the number of extra worker threads batch operations may
    /// spawn.
    pub fn max_num_worker_threads(&self) -> usize {
        self.max_num_worker_threads.load(Ordering::Acquire)
    }

    /// Sets the number of extra worker threads that resizing and
    /// locked-table rehashing may spawn. Zero (the default) keeps all work
    /// on the calling thread.
    pub fn set_max_num_worker_threads(&self, threads: usize) {
        self.max_num_worker_threads.store(threads, Ordering::Release);
    }

    /// The number of lock stripes currently in use.
    #[doc(hidden)]
    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// The packed epoch word of stripe `l`.
    #[doc(hidden)]
    pub fn stripe_epoch(&self, l: usize) -> u64 {
        self.stripes.stripe(l).epoch()
    }

    /// True if stripe `l` has its migrated bit set.
    #[doc(hidden)]
    pub fn stripe_migrated(&self, l: usize) -> bool {
        Stripe::is_migrated(self.stripes.stripe(l).epoch())
    }

    /// The element counter of stripe `l`.
    #[doc(hidden)]
    pub fn stripe_elems(&self, l: usize) -> i64 {
        self.stripes.stripe(l).elems()
    }

    pub(crate) fn buckets(&self) -> &BucketContainer<K, V, A, S> {
        &self.buckets
    }
}

// Hashing and locking plumbing shared by the read and write paths.
impl<K, V, H, A, const S: usize> CuckooMap<K, V, H, A, S>
where
    K: Eq + Hash,
    H: BuildHasher,
    A: Allocator,
{
    pub(crate) fn hashed_key<Q>(&self, key: &Q) -> HashValue
    where
        K: Borrow<Q>,
        Q: Hash + ?Sized,
    {
        let hash = hash_one::<K, Q, H>(&self.hash_builder, key);
        HashValue {
            hash,
            partial: partial_key(hash),
        }
    }

    fn hash_only<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + ?Sized,
    {
        hash_one::<K, Q, H>(&self.hash_builder, key)
    }

    // Rehashes the buckets covered by stripe `l` if the last doubling has
    // not reached them yet. Lazy migration only ever runs with the stripe
    // array at full size, which makes it stripe-local: the source and
    // destination bucket indices differ by a multiple of the stripe count.
    fn migrate_stripe(&self, l: usize) {
        debug_assert_eq!(self.stripes.len(), MAX_NUM_STRIPES);
        let old_hashpower = self.hashpower() - 1;
        let old_half = hashsize(old_hashpower);
        let mut bucket = l;
        while bucket < old_half {
            self.move_bucket(old_hashpower, bucket, CounterPolicy::Keep);
            bucket += MAX_NUM_STRIPES;
        }
    }

    // Moves the slots of the bucket at `old_index` that belong in the upper
    // half of a doubled table into their new bucket.
    //
    // Doubling the table adds one bit at position `old_hashpower` to the top
    // of every index, so anything that has to move lands exactly
    // `hashsize(old_hashpower)` above where it was.
    fn move_bucket(&self, old_hashpower: usize, old_index: usize, counters: CounterPolicy) {
        let new_hashpower = old_hashpower + 1;
        let new_index = old_index + hashsize(old_hashpower);
        let old_bucket = self.buckets.bucket(old_index);
        let new_bucket = self.buckets.bucket(new_index);
        let mut new_slot = 0;

        for slot in 0..S {
            if !old_bucket.occupied(slot) {
                continue;
            }
            let hv = self.hashed_key(unsafe { old_bucket.key(slot) });
            if !need_to_move_elem(hv, old_hashpower, new_hashpower, old_index, new_index) {
                continue;
            }
            let partial = old_bucket.partial(slot);
            let (key, value) = unsafe { old_bucket.take(slot) };
            unsafe { new_bucket.write(new_slot, partial, key, value) };
            new_slot += 1;

            if counters == CounterPolicy::Transfer {
                self.stripes.stripe(lock_ind(old_index)).add_elems(-1);
                self.stripes.stripe(lock_ind(new_index)).add_elems(1);
            }
        }
    }

    // Acquires stripe `l` (in normal mode) and brings its buckets up to date
    // with the most recent doubling. In locked mode every stripe is already
    // held, so only the migration check runs.
    fn lock_and_rehash(&self, l: usize, mode: TableMode) -> &Stripe {
        let stripe = self.stripes.stripe(l);
        let epoch = match mode {
            TableMode::Normal => stripe.lock(),
            TableMode::Locked => stripe.epoch(),
        };
        if !Stripe::is_migrated(epoch) {
            self.migrate_stripe(l);
            stripe.set_migrated(true);
        }
        stripe
    }

    // Locks the stripe covering one bucket index, with `modified`
    // controlling whether release advances the epoch.
    fn lock_one(
        &self,
        hashpower: usize,
        index: usize,
        mode: TableMode,
        modified: bool,
    ) -> Result<LockGuard<'_>, HashpowerChanged> {
        if mode == TableMode::Locked {
            return Ok(LockGuard::inactive());
        }
        let stripe = self.lock_and_rehash(lock_ind(index), TableMode::Normal);
        if self.hashpower() != hashpower {
            stripe.unlock();
            debug!("hashpower changed while locking one stripe");
            return Err(HashpowerChanged);
        }
        Ok(LockGuard {
            stripe: Some(stripe),
            modified,
        })
    }

    // Locks the stripes covering two bucket indexes, lowest stripe first to
    // avoid deadlock. If both indexes land on one stripe, only that one is
    // taken.
    pub(crate) fn lock_two(
        &self,
        hashpower: usize,
        i1: usize,
        i2: usize,
        mode: TableMode,
    ) -> Result<TwoBuckets<'_>, HashpowerChanged> {
        if mode == TableMode::Locked {
            return Ok(TwoBuckets::inactive(i1, i2));
        }
        let (mut l1, mut l2) = (lock_ind(i1), lock_ind(i2));
        if l2 < l1 {
            std::mem::swap(&mut l1, &mut l2);
        }
        let first = self.lock_and_rehash(l1, TableMode::Normal);
        if self.hashpower() != hashpower {
            first.unlock();
            debug!("hashpower changed while locking two stripes");
            return Err(HashpowerChanged);
        }
        let second = if l1 != l2 {
            Some(self.lock_and_rehash(l2, TableMode::Normal))
        } else {
            None
        };
        Ok(TwoBuckets {
            i1,
            i2,
            lock1: Some(first),
            lock2: second,
        })
    }

    // Locks the stripes covering three bucket indexes in stripe order,
    // returning them as a two (i1 and i2) and an extra guard for the third.
    // Duplicate stripes collapse to a single hold.
    fn lock_three(
        &self,
        hashpower: usize,
        i1: usize,
        i2: usize,
        i3: usize,
        mode: TableMode,
    ) -> Result<(TwoBuckets<'_>, LockGuard<'_>), HashpowerChanged> {
        if mode == TableMode::Locked {
            return Ok((TwoBuckets::inactive(i1, i2), LockGuard::inactive()));
        }
        let (l1, l2, l3) = (lock_ind(i1), lock_ind(i2), lock_ind(i3));
        let mut order = [l1, l2, l3];
        order.sort_unstable();

        let first = self.lock_and_rehash(order[0], TableMode::Normal);
        if self.hashpower() != hashpower {
            first.unlock();
            debug!("hashpower changed while locking three stripes");
            return Err(HashpowerChanged);
        }
        if order[1] != order[0] {
            self.lock_and_rehash(order[1], TableMode::Normal);
        }
        if order[2] != order[1] {
            self.lock_and_rehash(order[2], TableMode::Normal);
        }

        let two = TwoBuckets {
            i1,
            i2,
            lock1: Some(self.stripes.stripe(l1)),
            lock2: if l2 != l1 {
                Some(self.stripes.stripe(l2))
            } else {
                None
            },
        };
        let extra = if l3 != l1 && l3 != l2 {
            LockGuard {
                stripe: Some(self.stripes.stripe(l3)),
                modified: true,
            }
        } else {
            LockGuard::inactive()
        };
        Ok((two, extra))
    }

    // Computes a key's candidate buckets from the current hashpower and
    // locks their stripes, retrying until the hashpower stays put across the
    // acquisition. While the returned locks are held the bucket indices stay
    // valid.
    pub(crate) fn snapshot_and_lock_two(&self, hv: HashValue, mode: TableMode) -> TwoBuckets<'_> {
        loop {
            let hashpower = self.hashpower();
            let i1 = index_hash(hashpower, hv.hash);
            let i2 = alt_index(hashpower, hv.partial, i1);
            match self.lock_two(hashpower, i1, i2, mode) {
                Ok(buckets) => return buckets,
                Err(HashpowerChanged) => continue,
            }
        }
    }

    // Takes every stripe in ascending order. Performs no hashpower check and
    // no migrations.
    pub(crate) fn lock_all(&self, mode: TableMode) -> AllLocksGuard<'_, A> {
        if mode == TableMode::Locked {
            return AllLocksGuard { stripes: None };
        }
        self.stripes.stripe(0).lock();
        // Stripe growth requires holding stripe 0, so the count read after
        // taking it is stable for the rest of the acquisition.
        let count = self.stripes.len();
        for l in 1..count {
            self.stripes.stripe(l).lock();
        }
        AllLocksGuard {
            stripes: Some(&self.stripes),
        }
    }

    // Searches a bucket for the given key. Returns the slot index holding
    // it, or None.
    fn try_read_from_bucket<Q>(
        &self,
        bucket: &Bucket<K, V, S>,
        partial: u8,
        key: &Q,
    ) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        for slot in 0..S {
            if !bucket.occupied(slot) {
                continue;
            }
            if !is_simple::<K>() && partial != bucket.partial(slot) {
                continue;
            }
            // SAFETY: the slot is occupied; the caller either holds the
            // covering stripe or validates the read through the epoch
            // protocol afterwards.
            if unsafe { bucket.key(slot) }.borrow() == key {
                return Some(slot);
            }
        }
        None
    }

    // Searches a bucket for the key and for an empty slot. `Err(slot)` means
    // the key already lives at `slot`; `Ok(Some(slot))` is an empty slot;
    // `Ok(None)` means the bucket is full with no duplicate.
    fn try_find_insert_bucket<Q>(
        &self,
        index: usize,
        partial: u8,
        key: &Q,
    ) -> Result<Option<usize>, usize>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let bucket = self.buckets.bucket(index);
        let mut empty = None;
        for slot in 0..S {
            if bucket.occupied(slot) {
                if !is_simple::<K>() && partial != bucket.partial(slot) {
                    continue;
                }
                // SAFETY: occupied slot, stripes held by the caller.
                if unsafe { bucket.key(slot) }.borrow() == key {
                    return Err(slot);
                }
            } else {
                empty = Some(slot);
            }
        }
        Ok(empty)
    }

    // Searches both candidate buckets for the key, returning its position.
    // The covering stripes must be held (or the result validated through the
    // epoch protocol).
    pub(crate) fn cuckoo_find<Q>(
        &self,
        key: &Q,
        partial: u8,
        i1: usize,
        i2: usize,
    ) -> Option<(usize, usize)>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        if let Some(slot) = self.try_read_from_bucket(self.buckets.bucket(i1), partial, key) {
            return Some((i1, slot));
        }
        if let Some(slot) = self.try_read_from_bucket(self.buckets.bucket(i2), partial, key) {
            return Some((i2, slot));
        }
        None
    }

    // Writes a pair into a known-empty slot and bumps the owning stripe's
    // element counter.
    //
    // # Safety
    //
    // The slot must be empty and the covering stripe held (or all stripes).
    pub(crate) unsafe fn add_to_bucket(
        &self,
        index: usize,
        slot: usize,
        partial: u8,
        key: K,
        value: V,
    ) {
        self.buckets.bucket(index).write(slot, partial, key, value);
        self.stripes.stripe(lock_ind(index)).add_elems(1);
    }

    // Destroys the pair in a slot and decrements the owning stripe's element
    // counter.
    //
    // # Safety
    //
    // The slot must be occupied and the covering stripe held (or all
    // stripes).
    pub(crate) unsafe fn del_from_bucket(&self, index: usize, slot: usize) {
        self.buckets.bucket(index).erase(slot);
        self.stripes.stripe(lock_ind(index)).add_elems(-1);
    }

    // Reads stripe `l` for the optimistic path. Returns the stripe and its
    // sampled epoch if it is unheld and migrated; otherwise brings the
    // stripe up to date (taking it briefly if necessary) and reports None so
    // the caller retries.
    fn read_and_rehash(&self, l: usize) -> Option<(&Stripe, u64)> {
        let stripe = self.stripes.stripe(l);
        let epoch = stripe.epoch();
        if Stripe::is_locked(epoch) {
            return None;
        }
        if !Stripe::is_migrated(epoch) {
            let epoch = stripe.lock();
            if !Stripe::is_migrated(epoch) {
                self.migrate_stripe(l);
                stripe.set_migrated(true);
            }
            stripe.unlock();
            return None;
        }
        Some((stripe, epoch))
    }

    // The optimistic read path: resolve the candidate buckets, sample both
    // stripe epochs, copy the value out, and accept the copy only if the
    // epochs are unchanged afterwards.
    fn read_value<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let hv = self.hashed_key(key);
        loop {
            let hashpower = self.hashpower();
            let i1 = index_hash(hashpower, hv.hash);
            let i2 = alt_index(hashpower, hv.partial, i1);
            let l1 = lock_ind(i1);
            let l2 = lock_ind(i2);

            let Some((stripe1, epoch1)) = self.read_and_rehash(l1) else {
                continue;
            };
            if hashpower != self.hashpower() {
                continue;
            }
            let second = if l1 != l2 {
                match self.read_and_rehash(l2) {
                    Some(pair) => Some(pair),
                    None => continue,
                }
            } else {
                None
            };

            let found = self.cuckoo_find(key, hv.partial, i1, i2);

            let mut staged: MaybeUninit<V> = MaybeUninit::uninit();
            if let Some((index, slot)) = found {
                // SAFETY: a racy bitwise copy of the slot's value. The bytes
                // are only trusted after the epoch validation below proves
                // no writer overlapped the copy; on failure they are
                // discarded untouched. The volatile read keeps the copy a
                // plain byte transfer with no user code involved.
                unsafe {
                    let pair = self.buckets.bucket(index).pair_ptr(slot);
                    let value = std::ptr::addr_of!((*pair).1) as *const MaybeUninit<V>;
                    staged = value.read_volatile();
                }
            }

            // Order the bucket reads before the second epoch sample.
            fence(Ordering::Acquire);

            let valid = epoch1 == stripe1.epoch()
                && second.map_or(true, |(stripe2, epoch2)| epoch2 == stripe2.epoch());
            if !valid {
                continue;
            }
            if found.is_none() {
                return None;
            }
            // SAFETY: the epochs were even, migrated, and unchanged across
            // the copy, so `staged` holds the bytes of a value that was
            // live and stable for the whole window. For plain data that
            // bitwise copy *is* the value; otherwise clone from it and
            // leave the staged alias untouched (MaybeUninit never drops).
            let value = unsafe {
                if const { std::mem::needs_drop::<V>() } {
                    staged.assume_init_ref().clone()
                } else {
                    staged.assume_init_read()
                }
            };
            return Some(value);
        }
    }
}

impl<K, V, H, A, const S: usize> CuckooMap<K, V, H, A, S>
where
    K: Eq + Hash,
    H: BuildHasher,
    A: Allocator,
{
    /// Searches the map for `key` and invokes `f` on a stable copy of the
    /// associated value. Returns true if the key was found and `f` invoked.
    ///
    /// The copy is captured through the optimistic read protocol, so `f`
    /// runs outside of any lock.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = cuckoostripe::CuckooMap::with_capacity(8);
    /// map.insert(1u64, 10u64).unwrap();
    ///
    /// let mut seen = 0;
    /// assert!(map.find_fn(&1, |v| seen = *v));
    /// assert_eq!(seen, 10);
    /// assert!(!map.find_fn(&2, |_| unreachable!()));
    /// ```
    pub fn find_fn<Q, F>(&self, key: &Q, f: F) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
        F: FnOnce(&V),
    {
        match self.read_value(key) {
            Some(value) => {
                f(&value);
                true
            }
            None => false,
        }
    }

    /// Returns a copy of the value associated with `key`, or `None`.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = cuckoostripe::CuckooMap::with_capacity(8);
    /// map.insert(2, 17).unwrap();
    /// assert_eq!(map.find(&2), Some(17));
    /// assert_eq!(map.find(&3), None);
    /// ```
    pub fn find<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.read_value(key)
    }

    /// Returns true if the map contains `key`.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = cuckoostripe::CuckooMap::with_capacity(8);
    /// map.insert(1, 47u64).unwrap();
    /// assert!(map.contains(&1));
    /// assert!(!map.contains(&2));
    /// ```
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hv = self.hashed_key(key);
        loop {
            let hashpower = self.hashpower();
            let i1 = index_hash(hashpower, hv.hash);
            let i2 = alt_index(hashpower, hv.partial, i1);
            let l1 = lock_ind(i1);
            let l2 = lock_ind(i2);

            let Some((stripe1, epoch1)) = self.read_and_rehash(l1) else {
                continue;
            };
            if hashpower != self.hashpower() {
                continue;
            }
            let second = if l1 != l2 {
                match self.read_and_rehash(l2) {
                    Some(pair) => Some(pair),
                    None => continue,
                }
            } else {
                None
            };

            let found = self.cuckoo_find(key, hv.partial, i1, i2).is_some();

            fence(Ordering::Acquire);
            if epoch1 == stripe1.epoch()
                && second.map_or(true, |(stripe2, epoch2)| epoch2 == stripe2.epoch())
            {
                return found;
            }
        }
    }

    /// Searches for `key` and invokes `f` on a mutable reference to its
    /// value, under the covering stripe locks. Returns true if the key was
    /// found.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = cuckoostripe::CuckooMap::with_capacity(8);
    /// map.insert(9, 1).unwrap();
    /// assert!(map.update_fn(&9, |v| *v += 1));
    /// assert_eq!(map.find(&9), Some(2));
    /// ```
    pub fn update_fn<Q, F>(&self, key: &Q, f: F) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&mut V),
    {
        let hv = self.hashed_key(key);
        let mut buckets = self.snapshot_and_lock_two(hv, TableMode::Normal);
        match self.cuckoo_find(key, hv.partial, buckets.i1, buckets.i2) {
            Some((index, slot)) => {
                // SAFETY: the slot is occupied and its stripe is held.
                f(unsafe { self.buckets.bucket(index).value_mut(slot) });
                true
            }
            None => {
                buckets.unlock_no_modified();
                false
            }
        }
    }

    /// Replaces the value associated with `key` with `value`. Returns true
    /// if the key was present.
    pub fn update<Q>(&self, key: &Q, value: V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.update_fn(key, move |existing| *existing = value)
    }

    /// Searches for `key` and invokes the predicate `f` on its value under
    /// the stripe locks; the entry is erased if `f` returns true. Returns
    /// true if the key was found (whether or not it was erased).
    pub fn erase_fn<Q, F>(&self, key: &Q, f: F) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&mut V) -> bool,
    {
        let hv = self.hashed_key(key);
        let mut buckets = self.snapshot_and_lock_two(hv, TableMode::Normal);
        match self.cuckoo_find(key, hv.partial, buckets.i1, buckets.i2) {
            Some((index, slot)) => {
                // SAFETY: the slot is occupied and its stripe is held.
                if f(unsafe { self.buckets.bucket(index).value_mut(slot) }) {
                    unsafe { self.del_from_bucket(index, slot) };
                } else {
                    buckets.unlock_no_modified();
                }
                true
            }
            None => {
                buckets.unlock_no_modified();
                false
            }
        }
    }

    /// Erases `key` from the map. Returns true if it was present.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = cuckoostripe::CuckooMap::with_capacity(8);
    /// map.insert(2, 17).unwrap();
    /// assert!(map.erase(&2));
    /// assert!(!map.erase(&2));
    /// ```
    pub fn erase<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.erase_fn(key, |_| true)
    }
}

// The insert family needs `Send + Sync` bounds because a failed placement
// can trigger an expansion, and expansions may fan work out to the worker
// pool.
impl<K, V, H, A, const S: usize> CuckooMap<K, V, H, A, S>
where
    K: Eq + Hash + Send + Sync,
    V: Send + Sync,
    H: BuildHasher + Sync,
    A: Allocator + Sync,
{
    /// Inserts `key` and `value` if `key` is absent; otherwise invokes the
    /// predicate `f` on the existing value under the stripe locks, erasing
    /// the entry if `f` returns true. Returns `Ok(true)` if a new entry was
    /// inserted.
    ///
    /// The table expands automatically when placement fails; expansion may
    /// fail with [`Error`].
    pub fn uprase_fn<F>(&self, key: K, f: F, value: V) -> Result<bool, Error>
    where
        F: FnOnce(&mut V) -> bool,
    {
        let hv = self.hashed_key(&key);
        let mut buckets = self.snapshot_and_lock_two(hv, TableMode::Normal);
        let pos = self.cuckoo_insert_loop(hv, &mut buckets, &key, TableMode::Normal)?;
        if pos.is_vacancy() {
            // SAFETY: cuckoo_insert_loop returned an empty slot with both
            // stripes held.
            unsafe { self.add_to_bucket(pos.index, pos.slot, hv.partial, key, value) };
            Ok(true)
        } else {
            // SAFETY: the position refers to the occupied duplicate slot.
            if f(unsafe { self.buckets.bucket(pos.index).value_mut(pos.slot) }) {
                unsafe { self.del_from_bucket(pos.index, pos.slot) };
            }
            // The closure may have mutated the value either way, so the
            // drop-release advances the epochs and concurrent optimistic
            // readers re-validate.
            Ok(false)
        }
    }

    /// Inserts `key` and `value` if `key` is absent; otherwise invokes `f`
    /// on the existing value under the stripe locks. Returns `Ok(true)` if
    /// a new entry was inserted.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = cuckoostripe::CuckooMap::with_capacity(8);
    /// assert_eq!(map.upsert(1, |v| *v += 1, 0), Ok(true));
    /// assert_eq!(map.upsert(1, |v| *v += 1, 0), Ok(false));
    /// assert_eq!(map.find(&1), Some(1));
    /// ```
    pub fn upsert<F>(&self, key: K, f: F, value: V) -> Result<bool, Error>
    where
        F: FnOnce(&mut V),
    {
        self.uprase_fn(
            key,
            |existing| {
                f(existing);
                false
            },
            value,
        )
    }

    /// Inserts `key` and `value`. Returns `Ok(true)` if the key was absent,
    /// `Ok(false)` if it was already present (in which case the existing
    /// value is untouched and `value` is dropped).
    ///
    /// # Examples
    ///
    /// ```
    /// let map = cuckoostripe::CuckooMap::with_capacity(8);
    /// assert_eq!(map.insert(37, 12), Ok(true));
    /// assert_eq!(map.insert(37, 14), Ok(false));
    /// assert_eq!(map.find(&37), Some(12));
    /// ```
    pub fn insert(&self, key: K, value: V) -> Result<bool, Error> {
        self.upsert(key, |_| {}, value)
    }

    /// Inserts `key` and `value`, overwriting the existing value if the key
    /// was present. Returns `Ok(true)` if the key was absent.
    pub fn insert_or_assign(&self, key: K, value: V) -> Result<bool, Error>
    where
        V: Clone,
    {
        let assigned = value.clone();
        self.upsert(key, move |existing| *existing = assigned, value)
    }

    /// Resizes the table to the given hashpower. When shrinking, the target
    /// is clamped up to the smallest hashpower that holds the current
    /// elements. Returns `Ok(true)` if the table changed size.
    pub fn rehash(&self, hashpower: usize) -> Result<bool, Error> {
        if hashpower == self.hashpower() {
            return Ok(false);
        }
        self.cuckoo_change_capacity(hashpower, TableMode::Normal)
    }

    /// Grows the table to the given hashpower by repeated doubling, the
    /// concurrent-friendly path. Does nothing when the target is not larger
    /// than the current hashpower.
    pub fn rehash_concurrent(&self, hashpower: usize) -> Result<bool, Error> {
        if hashpower <= self.hashpower() {
            return Ok(false);
        }
        self.cuckoo_expand_simple(hashpower, TableMode::Normal)
            .map(|status| status == CuckooStatus::Ok)
    }

    /// Reserves space for `n` elements, shrinking the table if it is larger
    /// than needed. Returns `Ok(true)` if the table changed size.
    pub fn reserve(&self, n: usize) -> Result<bool, Error> {
        let new_hashpower = reserve_calc::<S>(n);
        if new_hashpower == self.hashpower() {
            return Ok(false);
        }
        self.cuckoo_change_capacity(new_hashpower, TableMode::Normal)
    }

    /// Grows the table so it can hold `n` elements, by repeated doubling.
    pub fn reserve_concurrent(&self, n: usize) -> Result<bool, Error> {
        let new_hashpower = reserve_calc::<S>(n);
        if new_hashpower <= self.hashpower() {
            return Ok(false);
        }
        self.cuckoo_expand_simple(new_hashpower, TableMode::Normal)
            .map(|status| status == CuckooStatus::Ok)
    }

    /// Removes every element, holding all stripes for the duration.
    pub fn clear(&self) {
        let _all = self.lock_all(TableMode::Normal);
        // SAFETY: every stripe is held.
        unsafe { self.cuckoo_clear() };
    }

    // Empties the table and resets the stripe counters.
    //
    // # Safety
    //
    // The caller must hold every stripe.
    pub(crate) unsafe fn cuckoo_clear(&self) {
        self.buckets.clear();
        for l in 0..self.stripes.len() {
            let stripe = self.stripes.stripe(l);
            stripe.reset_elems();
            stripe.set_migrated(true);
        }
    }

    /// Takes every stripe and returns an exclusive [`LockedTable`] handle,
    /// which exposes iterators and other whole-table operations. Any
    /// outstanding lazy migrations are completed (using the worker pool) on
    /// entry.
    pub fn lock_table(&self) -> LockedTable<'_, K, V, H, A, S> {
        LockedTable::new(self)
    }

    // Runs cuckoo_insert until it yields a definitive position, expanding
    // the table when it reports full and re-acquiring the stripes after any
    // concurrent expansion. On success the returned position's stripes are
    // held.
    pub(crate) fn cuckoo_insert_loop<'a>(
        &'a self,
        hv: HashValue,
        buckets: &mut TwoBuckets<'a>,
        key: &K,
        mode: TableMode,
    ) -> Result<TablePosition, Error> {
        loop {
            let hashpower = self.hashpower();
            let pos = self.cuckoo_insert(hv, buckets, key, mode);
            match pos.status {
                CuckooStatus::Ok | CuckooStatus::KeyDuplicated => return Ok(pos),
                CuckooStatus::TableFull => {
                    // Expand the table and try again, re-grabbing the locks.
                    self.cuckoo_fast_double(hashpower, mode, ResizeKind::Automatic)?;
                    *buckets = self.snapshot_and_lock_two(hv, mode);
                }
                CuckooStatus::UnderExpansion => {
                    // The table was expanded while we were cuckooing.
                    *buckets = self.snapshot_and_lock_two(hv, mode);
                }
            }
        }
    }

    // Tries to find an empty slot in either candidate bucket, running the
    // BFS displacement search when both are full. Expects the stripes to be
    // held on entry; on Ok and KeyDuplicated they are held on exit, on
    // TableFull and UnderExpansion they are released.
    fn cuckoo_insert<'a>(
        &'a self,
        hv: HashValue,
        buckets: &mut TwoBuckets<'a>,
        key: &K,
        mode: TableMode,
    ) -> TablePosition {
        let (i1, i2) = (buckets.i1, buckets.i2);
        let res1 = match self.try_find_insert_bucket(i1, hv.partial, key) {
            Err(slot) => {
                return TablePosition {
                    index: i1,
                    slot,
                    status: CuckooStatus::KeyDuplicated,
                }
            }
            Ok(res) => res,
        };
        let res2 = match self.try_find_insert_bucket(i2, hv.partial, key) {
            Err(slot) => {
                return TablePosition {
                    index: i2,
                    slot,
                    status: CuckooStatus::KeyDuplicated,
                }
            }
            Ok(res) => res,
        };
        if let Some(slot) = res1 {
            return TablePosition {
                index: i1,
                slot,
                status: CuckooStatus::Ok,
            };
        }
        if let Some(slot) = res2 {
            return TablePosition {
                index: i2,
                slot,
                status: CuckooStatus::Ok,
            };
        }

        // Both buckets are full, so we have to displace something.
        match self.run_cuckoo(buckets, mode) {
            RunCuckooResult::UnderExpansion => TablePosition {
                index: 0,
                slot: 0,
                status: CuckooStatus::UnderExpansion,
            },
            RunCuckooResult::Success(index, slot) => {
                debug_assert!(!self.buckets.bucket(index).occupied(slot));
                debug_assert!(
                    index == index_hash(self.hashpower(), hv.hash)
                        || index
                            == alt_index(
                                self.hashpower(),
                                hv.partial,
                                index_hash(self.hashpower(), hv.hash)
                            )
                );
                // The stripes were released during the displacement, so
                // another insert could have added this key. Check before
                // handing out the vacancy.
                if let Some((dup_index, dup_slot)) =
                    self.cuckoo_find(key, hv.partial, buckets.i1, buckets.i2)
                {
                    return TablePosition {
                        index: dup_index,
                        slot: dup_slot,
                        status: CuckooStatus::KeyDuplicated,
                    };
                }
                TablePosition {
                    index,
                    slot,
                    status: CuckooStatus::Ok,
                }
            }
            RunCuckooResult::Full => {
                debug!(
                    "hash table is full (hashpower = {}, hash_items = {}, load factor = {:.2}), \
                     need to increase hashpower",
                    self.hashpower(),
                    self.len(),
                    self.load_factor()
                );
                TablePosition {
                    index: 0,
                    slot: 0,
                    status: CuckooStatus::TableFull,
                }
            }
        }
    }

    // Performs cuckoo displacement to free a slot in one of the two insert
    // buckets. The stripes are released for the search, so the path is
    // re-validated step by step during the move; on Success the insert
    // stripes are held again.
    fn run_cuckoo<'a>(&'a self, buckets: &mut TwoBuckets<'a>, mode: TableMode) -> RunCuckooResult {
        // Release the insert stripes so the path search and move can lock
        // arbitrary stripes one or two at a time without violating the
        // ordering. The move re-locks the insert stripes on its last step,
        // so Success hands them back held.
        let hashpower = self.hashpower();
        buckets.unlock();

        let mut path = [EMPTY_RECORD; MAX_BFS_PATH_LEN];
        loop {
            let depth = match self.cuckoopath_search(hashpower, &mut path, buckets.i1, buckets.i2, mode)
            {
                Ok(Some(depth)) => depth,
                Ok(None) => return RunCuckooResult::Full,
                Err(HashpowerChanged) => return RunCuckooResult::UnderExpansion,
            };
            match self.cuckoopath_move(hashpower, &mut path, depth, buckets, mode) {
                Ok(true) => {
                    let index = path[0].bucket;
                    let slot = path[0].slot;
                    debug_assert!(index == buckets.i1 || index == buckets.i2);
                    debug_assert!(!self.buckets.bucket(index).occupied(slot));
                    return RunCuckooResult::Success(index, slot);
                }
                Ok(false) => continue,
                Err(HashpowerChanged) => return RunCuckooResult::UnderExpansion,
            }
        }
    }

    // Finds a cuckoo path from one of the starting buckets to an empty slot.
    // Returns the path depth, or None if no short-enough path exists. The
    // path is discovered without holding its locks, so the move re-checks
    // every step.
    fn cuckoopath_search(
        &self,
        hashpower: usize,
        path: &mut [CuckooRecord; MAX_BFS_PATH_LEN],
        i1: usize,
        i2: usize,
        mode: TableMode,
    ) -> Result<Option<usize>, HashpowerChanged> {
        let mut x = match self.slot_search(hashpower, i1, i2, mode)? {
            Some(slot) => slot,
            None => return Ok(None),
        };

        // Decode the slot choices from the end of the path to the beginning.
        for record in path.iter_mut().take(x.depth as usize + 1).rev() {
            record.slot = (x.pathcode as usize) % S;
            x.pathcode /= S as u16;
        }
        // The leftover pathcode says which starting bucket the path uses.
        path[0].bucket = if x.pathcode == 0 {
            i1
        } else {
            debug_assert_eq!(x.pathcode, 1);
            i2
        };
        {
            let _guard = self.lock_one(hashpower, path[0].bucket, mode, false)?;
            let bucket = self.buckets.bucket(path[0].bucket);
            if !bucket.occupied(path[0].slot) {
                // The path terminates early.
                return Ok(Some(0));
            }
            // SAFETY: occupied slot, stripe held by the guard.
            path[0].hv = self.hashed_key(unsafe { bucket.key(path[0].slot) });
        }
        for i in 1..=(x.depth as usize) {
            let prev = path[i - 1];
            debug_assert!(
                prev.bucket == index_hash(hashpower, prev.hv.hash)
                    || prev.bucket
                        == alt_index(
                            hashpower,
                            prev.hv.partial,
                            index_hash(hashpower, prev.hv.hash)
                        )
            );
            // The bucket the displaced key would move to is the alternate of
            // the one it sits in.
            let curr_bucket = alt_index(hashpower, prev.hv.partial, prev.bucket);
            path[i].bucket = curr_bucket;
            let _guard = self.lock_one(hashpower, curr_bucket, mode, false)?;
            let bucket = self.buckets.bucket(curr_bucket);
            if !bucket.occupied(path[i].slot) {
                // The path terminates early.
                return Ok(Some(i));
            }
            // SAFETY: occupied slot, stripe held by the guard.
            path[i].hv = self.hashed_key(unsafe { bucket.key(path[i].slot) });
        }
        Ok(Some(x.depth as usize))
    }

    // Breadth-first search over candidate buckets for an empty slot within
    // MAX_BFS_PATH_LEN displacements.
    fn slot_search(
        &self,
        hashpower: usize,
        i1: usize,
        i2: usize,
        mode: TableMode,
    ) -> Result<Option<BSlot>, HashpowerChanged> {
        const {
            assert!(
                const_pow(S, MAX_BFS_PATH_LEN) < u16::MAX as usize,
                "pathcode cannot encode a full cuckoo path for this many slots per bucket",
            )
        };

        let mut queue = BQueue::new(max_cuckoo_count(S));
        // The initial pathcode records which starting bucket the path uses.
        queue.enqueue(BSlot {
            bucket: i1,
            pathcode: 0,
            depth: 0,
        });
        queue.enqueue(BSlot {
            bucket: i2,
            pathcode: 1,
            depth: 0,
        });
        while !queue.is_empty() {
            let mut x = queue.dequeue();
            let _guard = self.lock_one(hashpower, x.bucket, mode, false)?;
            let bucket = self.buckets.bucket(x.bucket);
            // Start from a (sort of) random slot so repeated searches do not
            // keep kicking the same entries.
            let starting_slot = (x.pathcode as usize) % S;
            for i in 0..S {
                let slot = (starting_slot + i) % S;
                if !bucket.occupied(slot) {
                    x.pathcode = x.pathcode * S as u16 + slot as u16;
                    return Ok(Some(x));
                }

                // Enqueue the bucket this slot's occupant would be displaced
                // to, unless the path is already at full depth.
                if x.depth < MAX_BFS_PATH_LEN as i8 - 1 {
                    let partial = bucket.partial(slot);
                    queue.enqueue(BSlot {
                        bucket: alt_index(hashpower, partial, x.bucket),
                        pathcode: x.pathcode * S as u16 + slot as u16,
                        depth: x.depth + 1,
                    });
                }
            }
        }
        // No short-enough cuckoo path exists.
        Ok(None)
    }

    // Walks a discovered cuckoo path from its far end toward the start,
    // swapping the empty slot backward one displacement at a time. Each step
    // re-validates the path under the locks, since the table may have
    // changed since the search. On true the insert stripes are held; on
    // false they are not.
    fn cuckoopath_move<'a>(
        &'a self,
        hashpower: usize,
        path: &mut [CuckooRecord; MAX_BFS_PATH_LEN],
        mut depth: usize,
        buckets: &mut TwoBuckets<'a>,
        mode: TableMode,
    ) -> Result<bool, HashpowerChanged> {
        if depth == 0 {
            // The search found an empty slot in one of the insert buckets
            // themselves. Lock both and confirm the slot is still empty.
            let (i1, i2) = (buckets.i1, buckets.i2);
            debug_assert!(path[0].bucket == i1 || path[0].bucket == i2);
            *buckets = self.lock_two(hashpower, i1, i2, mode)?;
            if !self.buckets.bucket(path[0].bucket).occupied(path[0].slot) {
                return Ok(true);
            }
            buckets.unlock();
            return Ok(false);
        }

        while depth > 0 {
            let from = path[depth - 1];
            let to = path[depth];

            let held_two;
            let _extra;
            if depth == 1 {
                // The last swap moves an entry out of one of the insert
                // buckets, so lock both of them along with the swap target;
                // on success they stay held for the insert itself.
                let (two, extra) =
                    self.lock_three(hashpower, buckets.i1, buckets.i2, to.bucket, mode)?;
                held_two = two;
                _extra = extra;
            } else {
                held_two = self.lock_two(hashpower, from.bucket, to.bucket, mode)?;
                _extra = LockGuard::inactive();
            }

            let from_bucket = self.buckets.bucket(from.bucket);
            let to_bucket = self.buckets.bucket(to.bucket);

            // The occupant we planned to kick may have moved, the slot we
            // are filling may have been filled, or the slot we are moving
            // from may have been emptied. Matching hashes are enough: two
            // keys with equal hashes trace identical candidate buckets, so
            // the path stays valid either way.
            if to_bucket.occupied(to.slot)
                || !from_bucket.occupied(from.slot)
                || self.hash_only(unsafe { from_bucket.key(from.slot) }) != from.hv.hash
            {
                return Ok(false);
            }

            let partial = from_bucket.partial(from.slot);
            // SAFETY: both stripes are held, the source slot is occupied and
            // the destination slot is empty.
            unsafe {
                let (key, value) = from_bucket.take(from.slot);
                to_bucket.write(to.slot, partial, key, value);
            }
            if depth == 1 {
                // Hand the still-held insert stripes back to the caller.
                *buckets = held_two;
            }
            depth -= 1;
        }
        Ok(true)
    }

    // Doubles the table, exploiting the index structure: every entry either
    // stays in its bucket or moves up by exactly the old bucket count. For
    // small tables the migration runs eagerly in-thread; past the stripe
    // ceiling the stripes are marked unmigrated and the data moves lazily as
    // stripes are touched.
    fn cuckoo_fast_double(
        &self,
        current_hashpower: usize,
        mode: TableMode,
        kind: ResizeKind,
    ) -> Result<CuckooStatus, Error> {
        let new_hashpower = current_hashpower + 1;
        let _all = self.lock_all(mode);

        let status = self.check_resize_validity(current_hashpower, new_hashpower, kind)?;
        if status != CuckooStatus::Ok {
            return Ok(status);
        }

        // Finish any outstanding per-stripe migrations so the old half is
        // fully settled before we double again.
        self.rehash_all(current_hashpower);
        self.maybe_resize_stripes(current_hashpower);

        // The new segment is allocated before any live state changes, so an
        // allocation failure leaves the table as it was.
        // SAFETY: every stripe is held.
        unsafe { self.buckets.double() };

        if current_hashpower < MAX_NUM_STRIPES_POW {
            // With fewer buckets than stripes, on-demand rehashing would
            // need extra lower-index locks; the table is small, so migrate
            // everything here and now.
            for index in 0..hashsize(current_hashpower) {
                self.move_bucket(current_hashpower, index, CounterPolicy::Transfer);
            }
        } else {
            // Mark every stripe unmigrated; readers and writers move the
            // data on demand.
            for l in 0..self.stripes.len() {
                self.stripes.stripe(l).set_migrated(false);
            }
            if mode == TableMode::Locked {
                // Locked-table callers expect the bucket container to be
                // coherent without taking locks, so migrate everything
                // before returning.
                self.rehash_with_workers();
            }
        }
        Ok(CuckooStatus::Ok)
    }

    // Validates that a resize may proceed, surfacing configuration errors
    // and detecting a concurrent expansion.
    fn check_resize_validity(
        &self,
        orig_hashpower: usize,
        new_hashpower: usize,
        kind: ResizeKind,
    ) -> Result<CuckooStatus, Error> {
        let mhp = self.maximum_hashpower();
        if mhp != NO_MAXIMUM_HASHPOWER && new_hashpower > mhp {
            return Err(Error::MaximumHashpowerExceeded {
                hashpower: new_hashpower,
            });
        }
        if kind == ResizeKind::Automatic && self.load_factor() < self.minimum_load_factor() {
            return Err(Error::LoadFactorTooLow {
                load_factor: self.minimum_load_factor(),
            });
        }
        if self.hashpower() != orig_hashpower {
            // Most likely another expansion ran before this one could grab
            // the locks.
            debug!("another expansion is on-going");
            return Ok(CuckooStatus::UnderExpansion);
        }
        Ok(CuckooStatus::Ok)
    }

    // Doubles the stripe array when the bucket count is about to outgrow it,
    // keeping one stripe per bucket until the stripe ceiling.
    fn maybe_resize_stripes(&self, current_hashpower: usize) {
        if current_hashpower >= MAX_NUM_STRIPES_POW
            || self.stripes.power() > current_hashpower
        {
            return;
        }
        self.stripes.double();
    }

    // Completes every outstanding lazy migration. Only needed once the
    // table has grown past the stripe ceiling; below it, doublings migrate
    // eagerly and nothing is ever outstanding.
    fn rehash_all(&self, current_hashpower: usize) {
        if current_hashpower > MAX_NUM_STRIPES_POW {
            self.rehash_with_workers();
        }
    }

    // Migrates every stripe, fanning the work out to the worker pool. All
    // stripes must already be held; a panicking worker propagates when the
    // scope joins.
    pub(crate) fn rehash_with_workers(&self) {
        let stripes = self.stripes.len();
        self.parallel_exec(0, stripes, |start, end| {
            for l in start..end {
                self.lock_and_rehash(l, TableMode::Locked);
            }
        });
    }

    // Executes `func` over the given range, splitting the work between the
    // current thread and up to `max_num_worker_threads` extra threads.
    fn parallel_exec<F>(&self, start: usize, end: usize, func: F)
    where
        F: Fn(usize, usize) + Sync,
    {
        let extra_threads = self.max_num_worker_threads();
        let work_per_thread = (end - start) / (extra_threads + 1);
        if extra_threads == 0 || work_per_thread == 0 {
            func(start, end);
            return;
        }
        std::thread::scope(|scope| {
            let mut from = start;
            for _ in 0..extra_threads {
                let func = &func;
                let to = from + work_per_thread;
                scope.spawn(move || func(from, to));
                from = to;
            }
            func(from, end);
        });
    }

    // Grows the table to `new_hashpower` by repeated doubling under all
    // locks, the expansion path that keeps the bucket container coherent at
    // every step.
    fn cuckoo_expand_simple(
        &self,
        new_hashpower: usize,
        mode: TableMode,
    ) -> Result<CuckooStatus, Error> {
        let _all = self.lock_all(mode);
        while self.hashpower() < new_hashpower {
            let status = self.cuckoo_fast_double(
                self.hashpower(),
                TableMode::Locked,
                ResizeKind::Manual,
            )?;
            if status != CuckooStatus::Ok {
                return Ok(status);
            }
        }
        Ok(CuckooStatus::Ok)
    }

    // Resizes the table to exactly the requested hashpower (clamped so the
    // current elements fit) by moving every entry out and re-placing it in
    // the re-sized storage. Runs serially under all locks.
    pub(crate) fn cuckoo_change_capacity(
        &self,
        requested_hashpower: usize,
        mode: TableMode,
    ) -> Result<bool, Error> {
        let _all = self.lock_all(mode);
        let hashpower = self.hashpower();
        let size = self.len();
        let new_hashpower = requested_hashpower.max(reserve_calc::<S>(size));
        if new_hashpower == hashpower {
            return Ok(false);
        }
        let status = self.check_resize_validity(hashpower, new_hashpower, ResizeKind::Manual)?;
        debug_assert_eq!(status, CuckooStatus::Ok);

        // Settle any outstanding migrations, then move every pair out.
        self.rehash_all(hashpower);
        let mut entries: Vec<(K, V)> = Vec::with_capacity(size);
        for index in 0..self.buckets.len() {
            let bucket = self.buckets.bucket(index);
            for slot in 0..S {
                if bucket.occupied(slot) {
                    // SAFETY: every stripe is held.
                    entries.push(unsafe { bucket.take(slot) });
                }
            }
        }

        for l in 0..self.stripes.len() {
            let stripe = self.stripes.stripe(l);
            stripe.reset_elems();
            stripe.set_migrated(true);
        }
        // Grow the stripes before publishing the hashpower, so no thread can
        // pair the new bucket range with the old stripe range.
        while self.stripes.power() < new_hashpower.min(MAX_NUM_STRIPES_POW) {
            self.stripes.double();
        }
        // SAFETY: every stripe is held and every bucket is now empty.
        unsafe { self.buckets.set_hashpower(new_hashpower) };

        // Re-place everything; the counters rebuild as a side effect.
        for (key, value) in entries {
            let hv = self.hashed_key(&key);
            let mut buckets = self.snapshot_and_lock_two(hv, TableMode::Locked);
            let pos = self.cuckoo_insert_loop(hv, &mut buckets, &key, TableMode::Locked)?;
            debug_assert!(pos.is_vacancy());
            // SAFETY: cuckoo_insert_loop returned an empty slot.
            unsafe { self.add_to_bucket(pos.index, pos.slot, hv.partial, key, value) };
        }
        Ok(true)
    }
}

enum RunCuckooResult {
    Success(usize, usize),
    Full,
    UnderExpansion,
}

// Moving the table is keyed to new index bits only: an entry moves during a
// doubling iff its recomputed primary or alternate index under the new
// hashpower points at the destination bucket while the old one pointed at
// the source.
fn need_to_move_elem(
    hv: HashValue,
    old_hashpower: usize,
    new_hashpower: usize,
    old_index: usize,
    new_index: usize,
) -> bool {
    let old_ihash = index_hash(old_hashpower, hv.hash);
    let old_ahash = alt_index(old_hashpower, hv.partial, old_ihash);
    let new_ihash = index_hash(new_hashpower, hv.hash);
    let new_ahash = alt_index(new_hashpower, hv.partial, new_ihash);

    (old_index == old_ihash && new_ihash == new_index)
        || (old_index == old_ahash && new_ahash == new_index)
}

impl<K, V, H, A: Allocator, const S: usize> fmt::Debug for CuckooMap<K, V, H, A, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CuckooMap")
            .field("hashpower", &self.hashpower())
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_key_folds_the_whole_hash() {
        assert_eq!(partial_key(0), 0);
        assert_eq!(partial_key(0xff), 0xff);
        // Folding XORs the halves repeatedly, so a bit anywhere flips the
        // result.
        assert_ne!(partial_key(1 << 63), 0);
        assert_eq!(partial_key(0x0101_0101_0101_0101), 0);
    }

    #[test]
    fn alt_index_is_an_involution() {
        for hashpower in [1usize, 4, 9, 16] {
            for partial in [0u8, 1, 7, 0xff] {
                for index in [0usize, 1, 3, (1 << hashpower) - 1] {
                    let other = alt_index(hashpower, partial, index);
                    assert!(other < (1 << hashpower));
                    assert_eq!(alt_index(hashpower, partial, other), index);
                }
            }
        }
    }

    #[test]
    fn reserve_calc_rounds_up() {
        assert_eq!(reserve_calc::<4>(0), 0);
        assert_eq!(reserve_calc::<4>(1), 0);
        assert_eq!(reserve_calc::<4>(4), 0);
        assert_eq!(reserve_calc::<4>(5), 1);
        assert_eq!(reserve_calc::<4>(8), 1);
        assert_eq!(reserve_calc::<4>(9), 2);
        assert_eq!(reserve_calc::<4>(DEFAULT_SIZE), 16);
    }

    #[test]
    fn bfs_queue_capacity_matches_search_bound() {
        // Two starting buckets, geometric sum of slot fanout.
        assert_eq!(max_cuckoo_count(1), 10);
        assert_eq!(max_cuckoo_count(2), 62);
        assert_eq!(max_cuckoo_count(4), 682);
    }

    #[test]
    fn single_threaded_round_trip() {
        let map = CuckooMap::with_capacity(64);
        for i in 0..100u64 {
            assert_eq!(map.insert(i, i * 2), Ok(true));
        }
        assert_eq!(map.len(), 100);
        for i in 0..100u64 {
            assert_eq!(map.find(&i), Some(i * 2));
        }
        for i in 0..50u64 {
            assert!(map.erase(&i));
        }
        assert_eq!(map.len(), 50);
        for i in 0..50u64 {
            assert!(!map.contains(&i));
        }
        for i in 50..100u64 {
            assert!(map.contains(&i));
        }
    }

    #[test]
    fn update_paths() {
        let map = CuckooMap::with_capacity(16);
        assert!(!map.update(&1, 10));
        map.insert(1, 1).unwrap();
        assert!(map.update(&1, 10));
        assert_eq!(map.find(&1), Some(10));

        assert_eq!(map.insert_or_assign(2, 20), Ok(true));
        assert_eq!(map.insert_or_assign(2, 21), Ok(false));
        assert_eq!(map.find(&2), Some(21));
    }

    #[test]
    fn uprase_erases_on_true() {
        let map = CuckooMap::with_capacity(16);
        assert_eq!(map.uprase_fn(5, |_| true, 50), Ok(true));
        assert_eq!(map.find(&5), Some(50));
        // Present now, so the predicate runs and erases it.
        assert_eq!(map.uprase_fn(5, |_| true, 51), Ok(false));
        assert_eq!(map.find(&5), None);
    }

    #[test]
    fn string_keys_and_values() {
        let map: CuckooMap<String, String> = CuckooMap::with_capacity(16);
        map.insert("alpha".to_string(), "a".to_string()).unwrap();
        map.insert("beta".to_string(), "b".to_string()).unwrap();
        assert_eq!(map.find("alpha"), Some("a".to_string()));
        assert!(map.contains("beta"));
        assert!(map.erase("alpha"));
        assert!(!map.contains("alpha"));
    }
}
