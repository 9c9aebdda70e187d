//! Lock-free, page-granular allocator.
//!
//! Pages come straight from a [`MemorySource`] (the OS by default). Every
//! outstanding allocation is recorded as a [`Span`] inside a *registry*: one
//! or more pages holding an array of spans, so that [`Page::release`] can
//! validate the pointer and recover how many pages to give back.
//!
//! ```text
//!                    registry_ (one AtomicU128, updated only by DWCAS)
//!                        |
//!                        v
//!   +--------+--------+--------+--------+-----+        +--------+--------+-----+
//!   |  link  | (rsvd) | Span 0 | Span 1 | ... |  ---> |  link  | (rsvd) | ... | ---> ...
//!   +--------+--------+--------+--------+-----+        +--------+--------+-----+
//!     current registry page                              previous (full) page
//! ```
//!
//! The first [`SPAN_SET_START`] slots of a registry page are reserved; slot 0
//! stores the address of the previous registry page so lookups can walk every
//! registry ever created. Registry pages are never given back.
//!
//! Inserting a span claims a slot by compare-and-swapping the whole registry
//! record with `next_slot + 1`; the thread that wins the CAS owns the slot it
//! observed. A full (or not yet created) registry is replaced by a fresh page,
//! also through a single CAS; the loser returns its page.

use std::{
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

use portable_atomic::AtomicU128;

use crate::{
    error::{Error, Result},
    kernel::{Kernel, MemorySource},
    region::Region,
};

/// Number of pages used for every registry.
pub const REGISTRY_PAGES: usize = 1;

/// Largest page count a single allocation may request; the count must fit the
/// 16-bit field of a [`Span`].
pub const MAX_PAGES: usize = (1 << COUNT_BITS) - 1;

const ADDRESS_BITS: u32 = 48;
const COUNT_BITS: u32 = 16;
const SLOT_BITS: u32 = 12;
const STATE_BITS: u32 = 2;

const ADDRESS_MASK: u64 = (1 << ADDRESS_BITS) - 1;

/// Starting index of the span set inside a registry page. The first
/// `size_of::<Registry>()` bytes are reserved, slot 0 holding the chain link.
pub const SPAN_SET_START: usize = size_of::<u128>() / size_of::<Span>();

/// Tracks one outstanding page allocation.
///
/// 48 bits hold the address of the first page: every mainstream OS limits
/// userspace to a 48-bit virtual address space. The remaining 16 bits hold
/// the page count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Span(u64);

impl Span {
    /// Slot value of a span that was never written or was released.
    const EMPTY: u64 = 0;

    pub fn new(address: usize, count: usize) -> Self {
        debug_assert!((address as u64) <= ADDRESS_MASK, "address exceeds 48 bits");
        debug_assert!((1..=MAX_PAGES).contains(&count));

        Self((address as u64 & ADDRESS_MASK) | ((count as u64) << ADDRESS_BITS))
    }

    #[inline]
    pub fn address(self) -> usize {
        (self.0 & ADDRESS_MASK) as usize
    }

    #[inline]
    pub fn count(self) -> usize {
        (self.0 >> ADDRESS_BITS) as usize
    }

    #[inline]
    fn bits(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Inactive = 0,
    Empty = 1,
    Partial = 2,
    Full = 3,
}

impl State {
    fn from_bits(bits: u128) -> Self {
        match bits {
            0 => State::Inactive,
            1 => State::Empty,
            2 => State::Partial,
            _ => State::Full,
        }
    }
}

/// Double-word record describing the live registry.
///
/// ```text
///   bits [0, 48)     self_address   page holding the span array
///   bits [48, 60)    next_slot      next free index in that array
///   bits [60, 108)   next_registry  previous registry page
///   bits [108, 110)  state          Inactive / Empty / Partial / Full
///   bits [110, 128)  padding
/// ```
///
/// It is never updated field by field: a new value is computed and published
/// with one compare-and-swap of the whole 128 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Registry(u128);

impl Registry {
    const SLOT_SHIFT: u32 = ADDRESS_BITS;
    const NEXT_SHIFT: u32 = Self::SLOT_SHIFT + SLOT_BITS;
    const STATE_SHIFT: u32 = Self::NEXT_SHIFT + ADDRESS_BITS;

    const ADDRESS: u128 = (1 << ADDRESS_BITS) - 1;
    const SLOT: u128 = (1 << SLOT_BITS) - 1;
    const STATE: u128 = (1 << STATE_BITS) - 1;

    fn new(self_address: usize, next_slot: usize, next_registry: usize, state: State) -> Self {
        Self(
            (self_address as u128 & Self::ADDRESS)
                | ((next_slot as u128 & Self::SLOT) << Self::SLOT_SHIFT)
                | ((next_registry as u128 & Self::ADDRESS) << Self::NEXT_SHIFT)
                | ((state as u128) << Self::STATE_SHIFT),
        )
    }

    #[inline]
    pub fn self_address(self) -> usize {
        (self.0 & Self::ADDRESS) as usize
    }

    #[inline]
    pub fn next_slot(self) -> usize {
        ((self.0 >> Self::SLOT_SHIFT) & Self::SLOT) as usize
    }

    #[inline]
    pub fn next_registry(self) -> usize {
        ((self.0 >> Self::NEXT_SHIFT) & Self::ADDRESS) as usize
    }

    #[inline]
    pub fn state(self) -> State {
        State::from_bits((self.0 >> Self::STATE_SHIFT) & Self::STATE)
    }

    fn span_set(self) -> *const AtomicU64 {
        self.self_address() as *const AtomicU64
    }
}

/// Coarse-grained allocator that hands out multiples of the system page size.
/// The other allocators of this crate can use it to fetch their memory, but it
/// is available for general usage too.
///
/// Safe to share between threads: `allocate` and `release` never lock.
///
/// ```
/// use layeralloc::Page;
///
/// let pages = Page::new();
/// let ptr = pages.allocate(2).unwrap();
/// unsafe { ptr.as_ptr().write(42) };
/// pages.release(ptr.as_ptr()).unwrap();
/// ```
pub struct Page<M: MemorySource = Kernel> {
    source: M,
    registry: AtomicU128,
}

impl Page<Kernel> {
    pub const fn new() -> Self {
        Self::with_source(Kernel)
    }
}

impl Default for Page<Kernel> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: MemorySource> Page<M> {
    pub const fn with_source(source: M) -> Self {
        Self {
            source,
            registry: AtomicU128::new(0),
        }
    }

    /// Size of the unit handed out by this allocator, the OS page size.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.source.page_size()
    }

    /// Snapshot of the live registry record.
    #[inline]
    pub fn registry(&self) -> Registry {
        Registry(self.registry.load(Ordering::Acquire))
    }

    /// Exclusive end of the span set in a registry page. Bounded by what the
    /// 12-bit `next_slot` field can index.
    fn span_set_end(&self) -> usize {
        let slots = (REGISTRY_PAGES * self.source.page_size()) / size_of::<Span>();
        slots.min((1 << SLOT_BITS) - 1)
    }

    /// Number of spans one registry holds before it becomes full.
    pub fn span_capacity(&self) -> usize {
        self.span_set_end() - SPAN_SET_START
    }

    /// Allocates `count` contiguous pages.
    ///
    /// Fails with [`Error::InvalidInput`] if `count` is zero or larger than
    /// [`MAX_PAGES`], and with [`Error::Internal`] if the OS refuses or maps
    /// the pages above the 48-bit address space. If the pages were mapped but
    /// could not be recorded, they are returned before the error is reported.
    pub fn allocate(&self, count: usize) -> Result<NonNull<u8>> {
        if count == 0 || count > MAX_PAGES {
            return Err(Error::InvalidInput);
        }

        let region = self.source.fetch_pages(count).map_err(|_| Error::Internal)?;

        let address = region.base.as_ptr() as usize;
        if address as u64 > ADDRESS_MASK {
            tracing::error!(base = ?region.base, pages = count, "pages mapped above 48 bits, returning them");

            // SAFETY: the pages were fetched above and never handed out.
            unsafe { self.source.return_pages(region) }.map_err(|_| Error::Internal)?;

            return Err(Error::Internal);
        }

        let span = Span::new(address, count);

        if let Err(err) = self.register_span(span) {
            tracing::warn!(pages = count, error = %err, "span registration failed, returning pages");

            // SAFETY: the pages were fetched above and never handed out.
            if unsafe { self.source.return_pages(region) }.is_err() {
                return Err(Error::Internal);
            }

            return Err(err);
        }

        tracing::trace!(base = ?region.base, pages = count, "allocated pages");

        Ok(region.base)
    }

    /// Returns the pages starting at `ptr` to the OS.
    ///
    /// Fails with [`Error::InvalidInput`] if `ptr` is null or was not returned
    /// by [`Page::allocate`] (or was already released), and with
    /// [`Error::Internal`] if the OS refuses, in which case the allocation
    /// stays registered.
    pub fn release(&self, ptr: *mut u8) -> Result<()> {
        let base = NonNull::new(ptr).ok_or(Error::InvalidInput)?;

        let (slot, span) = self.take_span(base).ok_or(Error::InvalidInput)?;
        debug_assert_eq!(span.address(), base.as_ptr() as usize);

        let region = Region::new(base, span.count() * self.source.page_size());

        // SAFETY: the span proves the pages came from `fetch_pages`, and taking
        // it out of the registry makes this the only release of them.
        if unsafe { self.source.return_pages(region) }.is_err() {
            slot.store(span.bits(), Ordering::Relaxed);
            return Err(Error::Internal);
        }

        tracing::trace!(base = ?base, pages = span.count(), "released pages");

        Ok(())
    }

    /// Records `span` in the live registry, creating a new registry whenever
    /// there is none or the current one is full. Retries until it succeeds.
    pub fn register_span(&self, span: Span) -> Result<()> {
        let span_set_end = self.span_set_end();

        loop {
            let registry = self.registry();

            match registry.state() {
                State::Inactive | State::Full => {
                    self.create_new_registry(registry)?;
                    continue;
                }
                State::Empty | State::Partial => {}
            }

            let next_slot = registry.next_slot() + 1;
            let state = if next_slot == span_set_end {
                State::Full
            } else {
                State::Partial
            };
            let new_registry = Registry::new(
                registry.self_address(),
                next_slot,
                registry.next_registry(),
                state,
            );

            if self
                .registry
                .compare_exchange_weak(registry.0, new_registry.0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // The CAS winner is the only owner of the slot it observed.
                unsafe {
                    let slot = &*registry.span_set().add(registry.next_slot());
                    slot.store(span.bits(), Ordering::Relaxed);
                }

                return Ok(());
            }
        }
    }

    /// Publishes a fresh registry page in place of `registry`. Losing the race
    /// to another thread is not an error: the page is returned and the caller
    /// retries against whatever registry won.
    pub fn create_new_registry(&self, registry: Registry) -> Result<()> {
        let region = self
            .source
            .fetch_pages(REGISTRY_PAGES)
            .map_err(|_| Error::Internal)?;

        let previous = match registry.state() {
            State::Inactive => 0,
            _ => registry.self_address(),
        };

        // The page is private until the CAS below publishes it.
        unsafe {
            let link = &*region.base.as_ptr().cast::<AtomicU64>();
            link.store(previous as u64, Ordering::Relaxed);
        }

        let new_registry = Registry::new(
            region.base.as_ptr() as usize,
            SPAN_SET_START,
            previous,
            State::Empty,
        );

        match self
            .registry
            .compare_exchange(registry.0, new_registry.0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                tracing::debug!(
                    registry = ?region.base,
                    previous = previous,
                    "created span registry"
                );
                Ok(())
            }
            Err(_) => {
                tracing::trace!(registry = ?region.base, "lost registry race, returning page");

                // SAFETY: the page was never published.
                unsafe { self.source.return_pages(region) }.map_err(|_| Error::Internal)
            }
        }
    }

    /// Finds the span describing `base`, searching the live registry first and
    /// then every previous registry of the chain.
    pub fn find_span(&self, base: NonNull<u8>) -> Option<Span> {
        self.find_slot(base).map(|(_, span)| span)
    }

    fn find_slot(&self, base: NonNull<u8>) -> Option<(&AtomicU64, Span)> {
        let address = base.as_ptr() as usize as u64;
        let span_set_end = self.span_set_end();

        let registry = self.registry();
        if registry.state() == State::Inactive {
            return None;
        }

        let mut page = registry.span_set();

        while !page.is_null() {
            // SAFETY: registry pages are never unmapped, and every slot is
            // either zero or a span written by a CAS winner.
            unsafe {
                for i in SPAN_SET_START..span_set_end {
                    let slot = &*page.add(i);
                    let bits = slot.load(Ordering::Relaxed);

                    if bits != Span::EMPTY && bits & ADDRESS_MASK == address {
                        return Some((slot, Span(bits)));
                    }
                }

                page = (*page).load(Ordering::Relaxed) as usize as *const AtomicU64;
            }
        }

        None
    }

    /// Removes the span describing `base` from its registry. Of two racing
    /// callers only one gets it.
    fn take_span(&self, base: NonNull<u8>) -> Option<(&AtomicU64, Span)> {
        loop {
            let (slot, span) = self.find_slot(base)?;

            if slot
                .compare_exchange(span.bits(), Span::EMPTY, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some((slot, span));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingSource;
    use rstest::rstest;

    #[test]
    fn span_packs_address_and_count() {
        let span = Span::new(0x7fff_dead_b000, 17);

        assert_eq!(span.address(), 0x7fff_dead_b000);
        assert_eq!(span.count(), 17);
        assert_eq!(size_of::<Span>(), 8);
    }

    #[test]
    fn registry_fields_do_not_overlap() {
        let registry = Registry::new(0xffff_ffff_ffff, 0xfff, 0x1234_5678_9abc, State::Partial);

        assert_eq!(registry.self_address(), 0xffff_ffff_ffff);
        assert_eq!(registry.next_slot(), 0xfff);
        assert_eq!(registry.next_registry(), 0x1234_5678_9abc);
        assert_eq!(registry.state(), State::Partial);
        assert_eq!(size_of::<Registry>(), 16);
        assert_eq!(Registry::default().state(), State::Inactive);
    }

    #[rstest]
    #[case(0)]
    #[case(MAX_PAGES + 1)]
    #[case(1 << 20)]
    fn rejects_invalid_counts(#[case] count: usize) {
        let source = CountingSource::new();
        let pages = Page::with_source(&source);

        assert_eq!(pages.allocate(count), Err(Error::InvalidInput));
        assert_eq!(source.fetches(), 0);
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(64)]
    fn allocate_then_release(#[case] count: usize) {
        let source = CountingSource::new();
        let pages = Page::with_source(&source);

        let ptr = pages.allocate(count).unwrap();
        assert_eq!(ptr.as_ptr() as usize % pages.block_size(), 0);
        assert_eq!(source.outstanding_pages(), count + REGISTRY_PAGES);

        unsafe {
            let bytes = std::slice::from_raw_parts_mut(ptr.as_ptr(), count * pages.block_size());
            bytes.fill(0x5A);
        }

        assert_eq!(pages.find_span(ptr).map(Span::count), Some(count));

        pages.release(ptr.as_ptr()).unwrap();
        assert_eq!(source.outstanding_pages(), REGISTRY_PAGES);
        assert_eq!(pages.find_span(ptr), None);
    }

    #[test]
    fn largest_count_is_accepted() {
        let pages = Page::new();

        let ptr = pages.allocate(MAX_PAGES).unwrap();
        assert_eq!(pages.find_span(ptr).map(Span::count), Some(MAX_PAGES));
        pages.release(ptr.as_ptr()).unwrap();
    }

    #[test]
    fn release_rejects_null_and_unknown_pointers() {
        let pages = Page::new();
        let mut local = 0u8;

        assert_eq!(pages.release(std::ptr::null_mut()), Err(Error::InvalidInput));
        assert_eq!(pages.release(&mut local), Err(Error::InvalidInput));

        let ptr = pages.allocate(1).unwrap();
        assert_eq!(pages.release(&mut local), Err(Error::InvalidInput));
        pages.release(ptr.as_ptr()).unwrap();
    }

    #[test]
    fn release_succeeds_exactly_once() {
        let pages = Page::new();
        let ptr = pages.allocate(1).unwrap();

        assert_eq!(pages.release(ptr.as_ptr()), Ok(()));
        assert_eq!(pages.release(ptr.as_ptr()), Err(Error::InvalidInput));
    }

    #[test]
    fn registry_moves_through_states() {
        let pages = Page::new();
        assert_eq!(pages.registry().state(), State::Inactive);

        let first = pages.allocate(1).unwrap();
        let registry = pages.registry();
        assert_eq!(registry.state(), State::Partial);
        assert_eq!(registry.next_slot(), SPAN_SET_START + 1);
        assert_eq!(registry.next_registry(), 0);

        let mut held = vec![first];
        while pages.registry().state() != State::Full {
            held.push(pages.allocate(1).unwrap());
        }
        assert_eq!(held.len(), pages.span_capacity());

        for ptr in held {
            pages.release(ptr.as_ptr()).unwrap();
        }
    }

    #[test]
    fn spans_survive_registry_rollover() {
        let source = CountingSource::new();
        let pages = Page::with_source(&source);

        let capacity = pages.span_capacity();
        let held: Vec<_> = (0..capacity + 3).map(|_| pages.allocate(1).unwrap()).collect();

        let registry = pages.registry();
        assert_eq!(registry.state(), State::Partial);
        assert_ne!(registry.next_registry(), 0);
        assert_eq!(source.outstanding_pages(), held.len() + 2 * REGISTRY_PAGES);

        for ptr in &held {
            pages.release(ptr.as_ptr()).unwrap();
        }

        assert_eq!(source.outstanding_pages(), 2 * REGISTRY_PAGES);
    }

    #[test]
    fn registration_failure_returns_pages() {
        let source = CountingSource::new();
        let pages = Page::with_source(&source);

        // First fetch is the allocation itself, the second one the registry.
        source.fail_fetch_after(1);

        assert_eq!(pages.allocate(4), Err(Error::Internal));
        assert_eq!(source.outstanding_pages(), 0);
        assert_eq!(pages.registry().state(), State::Inactive);
    }

    #[test]
    fn failed_rollback_is_internal() {
        let source = CountingSource::new();
        let pages = Page::with_source(&source);

        source.fail_fetch_after(1);
        source.fail_returns(true);

        assert_eq!(pages.allocate(1), Err(Error::Internal));
        assert_eq!(source.outstanding_pages(), 1);

        source.fail_returns(false);
        source.reclaim_all();
    }

    #[test]
    fn failed_return_keeps_span() {
        let source = CountingSource::new();
        let pages = Page::with_source(&source);
        let ptr = pages.allocate(2).unwrap();

        source.fail_returns(true);
        assert_eq!(pages.release(ptr.as_ptr()), Err(Error::Internal));
        assert_eq!(pages.find_span(ptr).map(Span::count), Some(2));

        source.fail_returns(false);
        assert_eq!(pages.release(ptr.as_ptr()), Ok(()));
    }

    #[test]
    fn lost_registry_race_returns_page() {
        let source = CountingSource::new();
        let pages = Page::with_source(&source);

        let stale = pages.registry();
        pages.create_new_registry(stale).unwrap();
        assert_eq!(source.outstanding_pages(), REGISTRY_PAGES);

        // `stale` no longer matches the live registry, so this one loses.
        pages.create_new_registry(stale).unwrap();
        assert_eq!(source.outstanding_pages(), REGISTRY_PAGES);
        assert_eq!(pages.registry().state(), State::Empty);
    }

    /// Source that reports pages above the 48-bit address space. Nothing is
    /// mapped, so the memory must never be touched.
    #[cfg(target_pointer_width = "64")]
    #[derive(Default)]
    struct HighSource {
        returned: std::sync::atomic::AtomicUsize,
    }

    #[cfg(target_pointer_width = "64")]
    impl MemorySource for HighSource {
        fn page_size(&self) -> usize {
            4096
        }

        fn fetch_pages(&self, count: usize) -> Result<Region> {
            let base = NonNull::new((1usize << ADDRESS_BITS) as *mut u8).ok_or(Error::Internal)?;
            Ok(Region::new(base, count * self.page_size()))
        }

        unsafe fn return_pages(&self, _region: Region) -> Result<()> {
            self.returned.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn allocate_bytes(&self, _size: usize, _align: usize) -> Result<Region> {
            Err(Error::Internal)
        }

        unsafe fn release_bytes(&self, _region: Region, _align: usize) -> Result<()> {
            Err(Error::InvalidInput)
        }
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn pages_above_48_bits_are_returned() {
        let source = HighSource::default();
        let pages = Page::with_source(&source);

        assert_eq!(pages.allocate(3), Err(Error::Internal));
        assert_eq!(source.returned.load(Ordering::SeqCst), 1);
        assert_eq!(pages.registry().state(), State::Inactive);
    }
}
