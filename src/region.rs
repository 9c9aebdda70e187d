use std::ptr::NonNull;

/// A contiguous range of memory handed out by a [`crate::kernel::MemorySource`].
///
/// A region is produced by exactly one acquisition call and must be consumed
/// by exactly one matching release call. It is `Copy` only so that headers can
/// rebuild it from the size they store; it must never be handed to two
/// independent owners.
///
/// ```text
///   base                                   base + len
///    |                                          |
///    v                                          v
///    +------------------------------------------+
///    |                  len bytes               |
///    +------------------------------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First byte of the range.
    pub base: NonNull<u8>,
    /// Length of the range in bytes.
    pub len: usize,
}

impl Region {
    #[inline]
    pub const fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    /// Number of pages of `page_size` bytes covered by the region, rounding up.
    #[inline]
    pub fn pages(&self, page_size: usize) -> usize {
        self.len.div_ceil(page_size)
    }
}
