//! Immutable configuration for the [`crate::Block`] and [`crate::Bump`]
//! allocators.
//!
//! Options are resolved once, when the allocator is built, and never change
//! afterwards. Every builder is a `const fn`, so a configuration can be a
//! `const` item and a bad alignment is rejected by the compiler:
//!
//! ```
//! use layeralloc::{Limit, Options, WhenFull};
//!
//! const ARENA: Options = Options::new()
//!     .alignment(64)
//!     .size(16 * 1024)
//!     .limit(Limit::NoMoreThanSizeBytes)
//!     .grow(WhenFull::ReturnNull);
//!
//! assert_eq!(ARENA.alignment_value(), 64);
//! assert!(!ARENA.grow_when_full());
//! ```

use std::mem;

use crate::utils::{align_down, checked_align_up, is_power_of_two};

/// Library-wide default for the nominal block/chunk size.
pub const DEFAULT_SIZE: usize = 64 * 1024;

/// Smallest alignment any allocator in the crate hands out.
pub const MIN_ALIGNMENT: usize = mem::size_of::<*const u8>();

/// How the configured `size` relates to the memory actually requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Limit {
    /// `size` bytes must be usable, not counting header and alignment. The
    /// final size is rounded up.
    #[default]
    HaveAtLeastSizeBytes,
    /// `size` is a hard cap that includes header and alignment. The final
    /// size is rounded down.
    NoMoreThanSizeBytes,
}

/// What to do when the current block or chunk has no room for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WhenFull {
    /// Request another block/chunk.
    #[default]
    GrowStorage,
    /// Fail the request.
    ReturnNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    alignment: usize,
    size: usize,
    limit: Limit,
    grow: WhenFull,
}

impl Options {
    /// Default configuration: pointer-size alignment, [`DEFAULT_SIZE`],
    /// [`Limit::HaveAtLeastSizeBytes`] and [`WhenFull::GrowStorage`].
    pub const fn new() -> Self {
        Self {
            alignment: MIN_ALIGNMENT,
            size: DEFAULT_SIZE,
            limit: Limit::HaveAtLeastSizeBytes,
            grow: WhenFull::GrowStorage,
        }
    }

    /// Sets the alignment of blocks/chunks. Values below [`MIN_ALIGNMENT`] are
    /// raised to it. Alignments above the page size are honored by
    /// [`crate::Bump`] through byte-granular chunks, while [`crate::Block`]
    /// rejects provider memory that does not meet them.
    ///
    /// # Panics
    ///
    /// If `alignment` is not a power of two. In a `const` context this is a
    /// compile error.
    pub const fn alignment(mut self, alignment: usize) -> Self {
        assert!(is_power_of_two(alignment), "alignment must be a power of 2");

        self.alignment = if alignment < MIN_ALIGNMENT {
            MIN_ALIGNMENT
        } else {
            alignment
        };
        self
    }

    pub const fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub const fn limit(mut self, limit: Limit) -> Self {
        self.limit = limit;
        self
    }

    pub const fn grow(mut self, grow: WhenFull) -> Self {
        self.grow = grow;
        self
    }

    #[inline]
    pub const fn alignment_value(&self) -> usize {
        self.alignment
    }

    #[inline]
    pub const fn size_value(&self) -> usize {
        self.size
    }

    #[inline]
    pub const fn must_contain_size_bytes_in_space(&self) -> bool {
        matches!(self.limit, Limit::HaveAtLeastSizeBytes)
    }

    #[inline]
    pub const fn grow_when_full(&self) -> bool {
        matches!(self.grow, WhenFull::GrowStorage)
    }

    /// Final size of a region once `header_size` bytes of header and the
    /// alignment are accounted for, or `None` if that size overflows `usize`.
    pub const fn aligned_size(&self, header_size: usize) -> Option<usize> {
        if self.must_contain_size_bytes_in_space() {
            match self.size.checked_add(header_size) {
                Some(total) => checked_align_up(total, self.alignment),
                None => None,
            }
        } else {
            Some(align_down(self.size, self.alignment))
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}
