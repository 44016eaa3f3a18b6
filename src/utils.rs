//! Helper functions that don't belong to any concrete component of the allocator.

/// It aligns `to_be_aligned` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two. This is used to round payload sizes to
/// [`crate::ALIGNMENT`] and to move the program break to an aligned address before
/// the first growth.
#[inline]
pub const fn align(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Returns `true` if `addr` is a multiple of `alignment` (a power of two).
#[inline]
pub const fn is_aligned(addr: usize, alignment: usize) -> bool {
    addr & (alignment - 1) == 0
}
