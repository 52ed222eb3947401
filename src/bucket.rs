//! Module for the bucket storage of the map: a fixed-size slot group and a
//! power-of-two-segmented container of such groups.

use crate::util::{allocate_segment, deallocate_segment, segment_len, segment_of, AllocationKind};
use std::alloc::Allocator;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicPtr, AtomicU16, AtomicU8, AtomicUsize, Ordering};

// Enough segments for any hashpower a 64-bit process can address.
const MAX_SEGMENTS: usize = 64;

/// A fixed-capacity group of `S` slots, the unit of cuckoo placement.
///
/// Each slot stores an in-place key-value pair, a one-byte partial key, and a
/// bit in the occupancy bitmap. The bucket performs no synchronization of its
/// own: writers must hold the covering lock stripe, and optimistic readers
/// must validate the stripe epoch around any access. The occupancy bitmap and
/// partial bytes are atomics so that those racy reads are well-defined; the
/// pairs themselves live in an `UnsafeCell` and are only copied out through
/// the staged-read protocol in the map.
#[repr(align(64))]
pub(crate) struct Bucket<K, V, const S: usize> {
    occupied: AtomicU16,
    partials: [AtomicU8; S],
    slots: UnsafeCell<[MaybeUninit<(K, V)>; S]>,
}

impl<K, V, const S: usize> Bucket<K, V, S> {
    /// Returns true if the slot holds a live pair.
    #[inline]
    pub(crate) fn occupied(&self, slot: usize) -> bool {
        self.occupied.load(Ordering::Acquire) & (1 << slot) != 0
    }

    /// Returns the partial key stored for the slot. Meaningless unless the
    /// slot is occupied.
    #[inline]
    pub(crate) fn partial(&self, slot: usize) -> u8 {
        self.partials[slot].load(Ordering::Relaxed)
    }

    /// Returns a reference to the key in the slot.
    ///
    /// # Safety
    ///
    /// The slot must be occupied, and the caller must either hold the
    /// covering stripe or be inside an epoch-validated optimistic read.
    #[inline]
    pub(crate) unsafe fn key(&self, slot: usize) -> &K {
        &(*self.slots.get())[slot].assume_init_ref().0
    }

    /// Returns a reference to the value in the slot.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::key`].
    #[inline]
    pub(crate) unsafe fn value(&self, slot: usize) -> &V {
        &(*self.slots.get())[slot].assume_init_ref().1
    }

    /// Returns a mutable reference to the value in the slot.
    ///
    /// # Safety
    ///
    /// The slot must be occupied and the caller must hold the covering
    /// stripe.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn value_mut(&self, slot: usize) -> &mut V {
        &mut (*self.slots.get())[slot].assume_init_mut().1
    }

    /// Returns a raw pointer to the pair in the slot, for staged reads.
    #[inline]
    pub(crate) fn pair_ptr(&self, slot: usize) -> *const (K, V) {
        unsafe { (*self.slots.get())[slot].as_ptr() }
    }

    /// Constructs a pair in the slot and marks it occupied.
    ///
    /// # Safety
    ///
    /// The slot must be unoccupied and the caller must hold the covering
    /// stripe (or every stripe).
    #[inline]
    pub(crate) unsafe fn write(&self, slot: usize, partial: u8, key: K, value: V) {
        debug_assert!(!self.occupied(slot));
        (*self.slots.get())[slot].write((key, value));
        self.partials[slot].store(partial, Ordering::Relaxed);
        self.occupied.fetch_or(1 << slot, Ordering::Release);
    }

    /// Clears the occupancy bit and moves the pair out of the slot.
    ///
    /// # Safety
    ///
    /// The slot must be occupied and the caller must hold the covering
    /// stripe (or every stripe).
    #[inline]
    pub(crate) unsafe fn take(&self, slot: usize) -> (K, V) {
        debug_assert!(self.occupied(slot));
        self.occupied.fetch_and(!(1 << slot), Ordering::Release);
        (*self.slots.get())[slot].as_ptr().read()
    }

    /// Drops the pair in the slot and clears its occupancy bit.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::take`].
    #[inline]
    pub(crate) unsafe fn erase(&self, slot: usize) {
        drop(self.take(slot));
    }
}

/// A segmented array of `2^hashpower` buckets.
///
/// Doubling appends a segment; a bucket never moves once published, and no
/// segment is freed before the container drops. An optimistic reader that
/// raced a resize therefore dereferences live (if possibly stale) memory and
/// relies on the stripe epochs to reject the result. Shrinking only lowers
/// the hashpower: upper segments are kept for reuse by a later growth.
///
/// All methods that change the container or its slots require the caller to
/// hold the stripes covering the touched buckets, as documented per method.
pub(crate) struct BucketContainer<K, V, A: Allocator, const S: usize> {
    segments: [AtomicPtr<Bucket<K, V, S>>; MAX_SEGMENTS],
    /// Log2 of the current bucket count.
    hashpower: AtomicUsize,
    /// Log2 of the segment 0 length; fixed at construction.
    base_power: usize,
    alloc: A,
}

unsafe impl<K: Send, V: Send, A: Allocator + Send, const S: usize> Send
    for BucketContainer<K, V, A, S>
{
}
unsafe impl<K: Send + Sync, V: Send + Sync, A: Allocator + Sync, const S: usize> Sync
    for BucketContainer<K, V, A, S>
{
}

impl<K, V, A: Allocator, const S: usize> BucketContainer<K, V, A, S> {
    /// Creates a container with `2^hashpower` empty buckets.
    pub(crate) fn new(hashpower: usize, alloc: A) -> Self {
        let segments = [const { AtomicPtr::new(std::ptr::null_mut()) }; MAX_SEGMENTS];
        // A zeroed bucket is a valid empty bucket: zero occupancy bitmap,
        // zero partials, uninitialized slots.
        let ptr: *mut Bucket<K, V, S> =
            allocate_segment(&alloc, 1 << hashpower, AllocationKind::Zeroed);
        segments[0].store(ptr, Ordering::Release);
        BucketContainer {
            segments,
            hashpower: AtomicUsize::new(hashpower),
            base_power: hashpower,
            alloc,
        }
    }

    /// Log2 of the current bucket count.
    #[inline]
    pub(crate) fn hashpower(&self) -> usize {
        self.hashpower.load(Ordering::Acquire)
    }

    /// The current bucket count.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        1 << self.hashpower()
    }

    /// Returns the bucket at `index`, which must be below [`Self::len`] for
    /// the hashpower the caller snapshotted.
    #[inline]
    pub(crate) fn bucket(&self, index: usize) -> &Bucket<K, V, S> {
        let (segment, offset) = segment_of(index, self.base_power);
        let ptr = self.segments[segment].load(Ordering::Acquire);
        debug_assert!(!ptr.is_null());
        unsafe { &*ptr.add(offset) }
    }

    /// Makes sure backing segments exist for `2^hashpower` buckets.
    fn ensure_segments(&self, hashpower: usize) {
        if hashpower <= self.base_power {
            return;
        }
        for segment in 1..=(hashpower - self.base_power) {
            if self.segments[segment].load(Ordering::Acquire).is_null() {
                let len = segment_len(segment, self.base_power);
                let ptr: *mut Bucket<K, V, S> =
                    allocate_segment(&self.alloc, len, AllocationKind::Zeroed);
                self.segments[segment].store(ptr, Ordering::Release);
            }
        }
    }

    /// Doubles the bucket count in place. The new half is empty.
    ///
    /// The new segment is allocated before any published state changes, so an
    /// allocation failure leaves the container untouched.
    ///
    /// # Safety
    ///
    /// The caller must hold every stripe.
    pub(crate) unsafe fn double(&self) {
        let hashpower = self.hashpower();
        self.ensure_segments(hashpower + 1);
        self.hashpower.store(hashpower + 1, Ordering::Release);
    }

    /// Sets the bucket count to `2^hashpower`, allocating segments as needed.
    ///
    /// # Safety
    ///
    /// The caller must hold every stripe, and when shrinking, every bucket at
    /// or above the new count must already be empty.
    pub(crate) unsafe fn set_hashpower(&self, hashpower: usize) {
        self.ensure_segments(hashpower);
        self.hashpower.store(hashpower, Ordering::Release);
    }

    /// Drops every live pair and clears all occupancy bits.
    ///
    /// # Safety
    ///
    /// The caller must hold every stripe.
    pub(crate) unsafe fn clear(&self) {
        for index in 0..self.len() {
            let bucket = self.bucket(index);
            for slot in 0..S {
                if bucket.occupied(slot) {
                    bucket.erase(slot);
                }
            }
        }
    }

}

impl<K, V, A: Allocator, const S: usize> Drop for BucketContainer<K, V, A, S> {
    fn drop(&mut self) {
        unsafe { self.clear() };
        for (segment, slot) in self.segments.iter().enumerate() {
            let ptr = slot.load(Ordering::Relaxed);
            if !ptr.is_null() {
                deallocate_segment(&self.alloc, ptr, segment_len(segment, self.base_power));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::alloc::Global;

    #[test]
    fn write_take_erase() {
        let container: BucketContainer<u64, String, Global, 4> = BucketContainer::new(2, Global);
        assert_eq!(container.len(), 4);

        let bucket = container.bucket(3);
        assert!(!bucket.occupied(0));

        unsafe {
            bucket.write(0, 0xab, 17, "seventeen".to_string());
            assert!(bucket.occupied(0));
            assert_eq!(bucket.partial(0), 0xab);
            assert_eq!(*bucket.key(0), 17);
            assert_eq!(bucket.value(0), "seventeen");

            let (key, value) = bucket.take(0);
            assert_eq!(key, 17);
            assert_eq!(value, "seventeen");
            assert!(!bucket.occupied(0));
        }
    }

    #[test]
    fn doubling_keeps_low_buckets() {
        let container: BucketContainer<u32, u32, Global, 4> = BucketContainer::new(1, Global);
        unsafe { container.bucket(1).write(2, 7, 10, 20) };
        let before = container.bucket(1) as *const _;

        unsafe { container.double() };
        assert_eq!(container.len(), 4);
        assert_eq!(container.bucket(1) as *const _, before);
        assert!(container.bucket(1).occupied(2));
        assert!(!container.bucket(2).occupied(0));
        assert!(!container.bucket(3).occupied(0));
    }

    #[test]
    fn clear_drops_pairs() {
        let container: BucketContainer<u32, Vec<u8>, Global, 4> = BucketContainer::new(0, Global);
        unsafe {
            container.bucket(0).write(1, 3, 5, vec![1, 2, 3]);
            container.clear();
        }
        assert!(!container.bucket(0).occupied(1));
    }
}
