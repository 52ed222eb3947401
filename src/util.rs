use std::alloc::{Allocator, Layout};
use std::ptr::NonNull;

/// Rounds the `value` up to the nearest power of two.
#[inline]
pub fn round_to_pow2(value: usize) -> usize {
    value.next_power_of_two()
}

/// Splits a power-of-two-segmented index into a segment number and the offset
/// within that segment.
///
/// Segment 0 spans the first `1 << base_power` elements; every segment after
/// it doubles the total, so segment `k > 0` spans indexes
/// `[1 << (base_power + k - 1), 1 << (base_power + k))`. Storage laid out this
/// way can double without ever moving an element that has already been
/// published.
#[inline]
pub(crate) fn segment_of(index: usize, base_power: usize) -> (usize, usize) {
    if index < (1 << base_power) {
        (0, index)
    } else {
        let top = usize::BITS as usize - 1 - index.leading_zeros() as usize;
        (top - base_power + 1, index - (1 << top))
    }
}

/// The number of elements in the given segment.
#[inline]
pub(crate) fn segment_len(segment: usize, base_power: usize) -> usize {
    if segment == 0 {
        1 << base_power
    } else {
        1 << (base_power + segment - 1)
    }
}

/// How a fresh segment's memory should come back from the allocator.
pub(crate) enum AllocationKind {
    /// All-zero bytes are a valid initial state for the element type, as
    /// with bucket segments: cleared occupancy bitmaps and partial bytes,
    /// slot storage deliberately uninitialized.
    Zeroed,
    /// The caller initializes every element before publishing the segment,
    /// as with stripe segments.
    Uninitialized,
}

/// Allocates one storage segment of `len` elements of `T`.
///
/// Segment allocation sits on the table's growth path, where the ordering
/// contract is "allocate before touching live state": a panic out of here
/// leaves the table exactly as it was.
pub(crate) fn allocate_segment<T, A: Allocator>(
    alloc: &A,
    len: usize,
    kind: AllocationKind,
) -> *mut T {
    let layout = Layout::array::<T>(len).expect("segment layout overflows");
    let block = match kind {
        AllocationKind::Zeroed => alloc.allocate_zeroed(layout),
        AllocationKind::Uninitialized => alloc.allocate(layout),
    };
    block.expect("segment allocation failed").as_ptr() as *mut T
}

/// Returns a storage segment of `len` elements of `T` to the allocator. The
/// elements must already be dropped (or never initialized).
pub(crate) fn deallocate_segment<T, A: Allocator>(alloc: &A, ptr: *mut T, len: usize) {
    let layout = Layout::array::<T>(len).expect("segment layout overflows");
    let Some(block) = NonNull::new(ptr as *mut u8) else {
        return;
    };
    unsafe { alloc.deallocate(block, layout) };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn segmented_index_math() {
        // base_power 3: segment 0 covers 0..8, segment 1 covers 8..16,
        // segment 2 covers 16..32, ...
        assert_eq!(segment_of(0, 3), (0, 0));
        assert_eq!(segment_of(7, 3), (0, 7));
        assert_eq!(segment_of(8, 3), (1, 0));
        assert_eq!(segment_of(15, 3), (1, 7));
        assert_eq!(segment_of(16, 3), (2, 0));
        assert_eq!(segment_of(31, 3), (2, 15));
        assert_eq!(segment_of(32, 3), (3, 0));

        assert_eq!(segment_len(0, 3), 8);
        assert_eq!(segment_len(1, 3), 8);
        assert_eq!(segment_len(2, 3), 16);
        assert_eq!(segment_len(3, 3), 32);
    }

    #[test]
    fn segmented_index_math_base_zero() {
        assert_eq!(segment_of(0, 0), (0, 0));
        assert_eq!(segment_of(1, 0), (1, 0));
        assert_eq!(segment_of(2, 0), (2, 0));
        assert_eq!(segment_of(3, 0), (2, 1));
        assert_eq!(segment_of(4, 0), (3, 0));
        assert_eq!(segment_len(1, 0), 1);
        assert_eq!(segment_len(2, 0), 2);
    }
}
