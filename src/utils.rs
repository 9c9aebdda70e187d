//! Alignment helpers shared by every allocator layer.

/// Rounds `to_be_aligned` up to the next multiple of `alignment`.
///
/// Used to size blocks and chunks so that they are a multiple of the
/// configured alignment, and to round bump requests so that every pointer
/// handed out stays aligned. `alignment` must be a power of two.
#[inline]
pub const fn align_up(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Same as [`align_up`] but returns `None` instead of overflowing.
#[inline]
pub const fn checked_align_up(to_be_aligned: usize, alignment: usize) -> Option<usize> {
    match to_be_aligned.checked_add(alignment - 1) {
        Some(sum) => Some(sum & !(alignment - 1)),
        None => None,
    }
}

/// Rounds `to_be_aligned` down to a multiple of `alignment`.
#[inline]
pub const fn align_down(to_be_aligned: usize, alignment: usize) -> usize {
    to_be_aligned & !(alignment - 1)
}

#[inline]
pub const fn is_power_of_two(value: usize) -> bool {
    value != 0 && value & (value - 1) == 0
}
