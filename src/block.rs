use std::ptr::NonNull;

use crate::{
    error::{Error, Result},
    list::{self, HEADER_SIZE, Header, Link},
    options::Options,
    page::Page,
    provider::Provider,
    region::Region,
};

/// Header placed at the start of every block.
pub type BlockHeader = Header;

/// Overhead of a block's header, counted against its size.
pub const BLOCK_HEADER_SIZE: usize = HEADER_SIZE;

/// Coarse-grained allocator that hands out fixed-size, aligned blocks taken
/// from a [`Provider`]. It is the building block for higher level allocators
/// (free lists, slabs): it exposes block acquisition and release, and leaves
/// the decision of when to grow to its consumer.
///
/// Every block starts with a [`BlockHeader`], so blocks can be chained into
/// an intrusive list and released together:
///
/// ```text
/// +----------------------------+      +----------------------------+
/// | BlockHeader |   content    | ---> | BlockHeader |   content    | ---> None
/// +----------------------------+      +----------------------------+
/// |<------- aligned_size ----->|
/// ```
///
/// Not thread safe; callers that share it must lock around it.
pub struct Block<P: Provider = Page> {
    provider: P,
    options: Options,
}

impl<P: Provider + Default> Block<P> {
    pub fn new(options: Options) -> Self {
        Self::with_provider(P::default(), options)
    }
}

impl Default for Block<Page> {
    fn default() -> Self {
        Self::new(Options::new())
    }
}

impl<P: Provider> Block<P> {
    /// Builds an allocator over `provider`, which may be owned or borrowed.
    pub fn with_provider(provider: P, options: Options) -> Self {
        Self { provider, options }
    }

    #[inline]
    pub fn options(&self) -> &Options {
        &self.options
    }

    #[inline]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Size of every block once header and alignment are accounted for.
    ///
    /// With [`crate::Limit::HaveAtLeastSizeBytes`] the configured size is
    /// usable on top of the header and the result is rounded up; with
    /// [`crate::Limit::NoMoreThanSizeBytes`] it is a cap and the result is
    /// rounded down. `None` if the configured size overflows once the header
    /// is added.
    #[inline]
    pub fn aligned_size(&self) -> Option<usize> {
        self.options.aligned_size(BLOCK_HEADER_SIZE)
    }

    /// Requests a new block from the provider and links it in front of
    /// `next`. Provider errors are passed through unchanged.
    ///
    /// Fails with [`Error::InvalidInput`] if the configured size overflows or
    /// cannot even hold the header, and if the provider's memory is not
    /// aligned to the configured alignment. In the latter case the memory is
    /// given back first.
    pub fn allocate_new_block(&self, next: Link<BlockHeader>) -> Result<NonNull<BlockHeader>> {
        let size = match self.aligned_size() {
            Some(size) if size >= BLOCK_HEADER_SIZE => size,
            _ => return Err(Error::InvalidInput),
        };

        let base = Provider::provide(&self.provider, size)?;

        let alignment = self.options.alignment_value();
        if base.as_ptr() as usize % alignment != 0 {
            tracing::warn!(base = ?base, alignment, "provider memory is under-aligned, returning it");

            // SAFETY: `base` was provided above and never handed out.
            unsafe { Provider::release(&self.provider, base) }.map_err(|_| Error::Internal)?;

            return Err(Error::InvalidInput);
        }

        // SAFETY: the provider just handed out `size` writable bytes, aligned
        // to `alignment`.
        Ok(unsafe { Header::create(Region::new(base, size), next) })
    }

    /// Returns a single block to the provider. Its `next` link is ignored.
    ///
    /// **SAFETY**: `block` must come from [`Block::allocate_new_block`] on this
    /// allocator and must not be used afterwards.
    pub unsafe fn release_block(&self, block: NonNull<BlockHeader>) -> Result<()> {
        unsafe { Provider::release(&self.provider, block.cast::<u8>()) }.map_err(|err| {
            tracing::error!(block = ?block, error = %err, "block release failed");
            Error::Internal
        })
    }

    /// Returns every block from `head` up to, excluding, `sentinel`.
    ///
    /// The walk stops at the first block the provider refuses and the whole
    /// call reports [`Error::Internal`]; blocks before it were released, the
    /// refused block and those after it are still owned by the caller.
    ///
    /// **SAFETY**: every block in the range must come from this allocator and
    /// none of them may be used afterwards.
    pub unsafe fn release_all_blocks(&self, head: Link<BlockHeader>, sentinel: Link<BlockHeader>) -> Result<()> {
        let release =
            |block: NonNull<BlockHeader>| unsafe { Provider::release(&self.provider, block.cast::<u8>()) };

        unsafe { list::release_list(head, sentinel, release) }.map_err(|_| Error::Internal)
    }
}
