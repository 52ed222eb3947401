use crate::util::{allocate_segment, deallocate_segment, segment_len, segment_of, AllocationKind};
use std::alloc::Allocator;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

/// Log2 of the maximum number of lock stripes a table will ever use.
pub(crate) const MAX_NUM_STRIPES_POW: usize = 16;

/// The maximum number of lock stripes a table will ever use.
pub(crate) const MAX_NUM_STRIPES: usize = 1 << MAX_NUM_STRIPES_POW;

// The stripe count starts at 2^initial_power and doubles up to 2^16, so the
// segmented storage needs at most 17 segments.
const MAX_SEGMENTS: usize = MAX_NUM_STRIPES_POW + 1;

const HELD_BIT: u64 = 1;
const MIGRATED_BIT: u64 = 1 << 1;

/// One logical increment of the 62-bit epoch stored above the flag bits.
const EPOCH_ONE: u64 = 1 << 2;

/// A sequence lock guarding a stripe of buckets.
///
/// The packed `state` word holds a held bit, a migrated bit, and a 62-bit
/// epoch. The epoch advances once on every acquire and once on every release,
/// so it is odd exactly while the stripe is held. Optimistic readers sample
/// the whole packed word before and after reading bucket data and accept the
/// read only if both samples are equal, unheld, and migrated.
///
/// The element counter tracks insertions minus erasures performed under this
/// stripe; only the sum over all stripes is meaningful.
pub(crate) struct Stripe {
    state: AtomicU64,
    elems: AtomicI64,
}

impl Stripe {
    /// Returns the current packed epoch word.
    #[inline]
    pub(crate) fn epoch(&self) -> u64 {
        self.state.load(Ordering::Acquire)
    }

    /// Returns true if the packed word has the held bit set.
    #[inline]
    pub(crate) fn is_locked(epoch: u64) -> bool {
        epoch & HELD_BIT != 0
    }

    /// Returns true if the packed word has the migrated bit set.
    #[inline]
    pub(crate) fn is_migrated(epoch: u64) -> bool {
        epoch & MIGRATED_BIT != 0
    }

    /// Spins until the stripe can be acquired, then acquires it and returns
    /// the new (odd) packed word. Never fails and never times out.
    pub(crate) fn lock(&self) -> u64 {
        loop {
            let current = self.state.load(Ordering::Relaxed);
            if Self::is_locked(current) {
                std::hint::spin_loop();
                continue;
            }
            let next = (current + EPOCH_ONE) | HELD_BIT;
            if self
                .state
                .compare_exchange_weak(current, next, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return next;
            }
        }
    }

    /// Releases the stripe, advancing the epoch so that any overlapping
    /// optimistic read fails validation.
    #[inline]
    pub(crate) fn unlock(&self) {
        let current = self.state.load(Ordering::Relaxed);
        debug_assert!(Self::is_locked(current));
        self.state
            .store((current + EPOCH_ONE) & !HELD_BIT, Ordering::Release);
    }

    /// Releases the stripe without advancing the epoch, restoring the value
    /// readers observed before the acquire. Only valid when the critical
    /// section performed no logical mutation.
    #[inline]
    pub(crate) fn unlock_no_modified(&self) {
        let current = self.state.load(Ordering::Relaxed);
        debug_assert!(Self::is_locked(current));
        self.state
            .store((current - EPOCH_ONE) & !HELD_BIT, Ordering::Release);
    }

    /// Sets or clears the migrated bit. The caller must hold the stripe, or
    /// hold every stripe in the table.
    #[inline]
    pub(crate) fn set_migrated(&self, migrated: bool) {
        if migrated {
            self.state.fetch_or(MIGRATED_BIT, Ordering::Release);
        } else {
            self.state.fetch_and(!MIGRATED_BIT, Ordering::Release);
        }
    }

    /// Adds `n` to the element counter. Called with the stripe held.
    #[inline]
    pub(crate) fn add_elems(&self, n: i64) {
        self.elems.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns the element counter.
    #[inline]
    pub(crate) fn elems(&self) -> i64 {
        self.elems.load(Ordering::Relaxed)
    }

    /// Resets the element counter. The caller must hold every stripe.
    #[inline]
    pub(crate) fn reset_elems(&self) {
        self.elems.store(0, Ordering::Relaxed);
    }
}

/// A grow-only array of [`Stripe`]s.
///
/// Growth appends power-of-two segments, so a stripe never moves once it has
/// been published: a thread that computed a stripe index from a stale
/// hashpower still dereferences a live stripe and discovers the staleness
/// through the epoch protocol. The array doubles only while the table has
/// fewer buckets than `MAX_NUM_STRIPES`, and only while every current stripe
/// is held.
pub(crate) struct StripeArray<A: Allocator> {
    segments: [AtomicPtr<Stripe>; MAX_SEGMENTS],
    /// Log2 of the current stripe count.
    power: AtomicUsize,
    /// Log2 of the segment 0 length; fixed at construction.
    base_power: usize,
    alloc: A,
}

unsafe impl<A: Allocator + Send> Send for StripeArray<A> {}
unsafe impl<A: Allocator + Sync> Sync for StripeArray<A> {}

impl<A: Allocator> StripeArray<A> {
    /// Creates an array of `2^power` stripes, all unheld, migrated, and with
    /// zeroed counters.
    pub(crate) fn new(power: usize, alloc: A) -> Self {
        debug_assert!(power <= MAX_NUM_STRIPES_POW);
        let segments = [const { AtomicPtr::new(std::ptr::null_mut()) }; MAX_SEGMENTS];
        let len = 1usize << power;
        let ptr: *mut Stripe = allocate_segment(&alloc, len, AllocationKind::Uninitialized);
        for i in 0..len {
            unsafe {
                ptr.add(i).write(Stripe {
                    state: AtomicU64::new(MIGRATED_BIT),
                    elems: AtomicI64::new(0),
                });
            }
        }
        segments[0].store(ptr, Ordering::Release);
        StripeArray {
            segments,
            power: AtomicUsize::new(power),
            base_power: power,
            alloc,
        }
    }

    /// Log2 of the current stripe count.
    #[inline]
    pub(crate) fn power(&self) -> usize {
        self.power.load(Ordering::Acquire)
    }

    /// The current stripe count.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        1 << self.power()
    }

    /// Returns the stripe at `index`, which must be below [`Self::len`].
    #[inline]
    pub(crate) fn stripe(&self, index: usize) -> &Stripe {
        debug_assert!(index < self.len());
        let (segment, offset) = segment_of(index, self.base_power);
        let ptr = self.segments[segment].load(Ordering::Acquire);
        debug_assert!(!ptr.is_null());
        unsafe { &*ptr.add(offset) }
    }

    /// Doubles the stripe count.
    ///
    /// The caller must hold every current stripe. The new stripes are created
    /// *held* and migrated, so that the all-locks holder releases them
    /// together with the rest when its guard drops.
    pub(crate) fn double(&self) {
        let power = self.power();
        debug_assert!(power < MAX_NUM_STRIPES_POW);
        let segment = power - self.base_power + 1;
        let len = segment_len(segment, self.base_power);
        debug_assert_eq!(len, 1 << power);

        debug_assert!(self.segments[segment].load(Ordering::Acquire).is_null());
        let ptr: *mut Stripe = allocate_segment(&self.alloc, len, AllocationKind::Uninitialized);
        for i in 0..len {
            unsafe {
                ptr.add(i).write(Stripe {
                    state: AtomicU64::new(EPOCH_ONE | HELD_BIT | MIGRATED_BIT),
                    elems: AtomicI64::new(0),
                });
            }
        }
        self.segments[segment].store(ptr, Ordering::Release);
        self.power.store(power + 1, Ordering::Release);
    }
}

impl<A: Allocator> Drop for StripeArray<A> {
    fn drop(&mut self) {
        for (segment, slot) in self.segments.iter().enumerate() {
            let ptr = slot.load(Ordering::Relaxed);
            if !ptr.is_null() {
                deallocate_segment(&self.alloc, ptr, segment_len(segment, self.base_power));
            }
        }
    }
}
