use std::ptr::NonNull;

use crate::{
    error::{Error, Result},
    kernel::MemorySource,
    page::Page,
};

/// Source of coarse memory for a higher allocator layer.
///
/// A provider hands out regions of at least the requested size and takes them
/// back by base address alone, so it has to remember the size itself.
pub trait Provider {
    /// Returns the base of a fresh region of at least `size` bytes, aligned to
    /// at least the provider's own granularity.
    fn provide(&self, size: usize) -> Result<NonNull<u8>>;

    /// Gives back a region obtained from [`Provider::provide`].
    ///
    /// **SAFETY**: `base` must come from `provide` on this provider and must
    /// not be used after this call.
    unsafe fn release(&self, base: NonNull<u8>) -> Result<()>;
}

/// Lets an allocator borrow its provider instead of owning it.
impl<P: Provider + ?Sized> Provider for &P {
    fn provide(&self, size: usize) -> Result<NonNull<u8>> {
        (**self).provide(size)
    }

    unsafe fn release(&self, base: NonNull<u8>) -> Result<()> {
        unsafe { (**self).release(base) }
    }
}

/// Serves requests in whole pages, rounding `size` up.
impl<M: MemorySource> Provider for Page<M> {
    fn provide(&self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::InvalidInput);
        }

        self.allocate(size.div_ceil(self.block_size()))
    }

    unsafe fn release(&self, base: NonNull<u8>) -> Result<()> {
        Page::release(self, base.as_ptr())
    }
}
