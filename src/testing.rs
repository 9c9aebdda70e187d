//! Test doubles shared by the unit tests of every allocator.

use std::{
    ptr::NonNull,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use crate::{
    error::{Error, Result},
    kernel::{Kernel, MemorySource},
    region::Region,
};

/// [`MemorySource`] that forwards to [`Kernel`] while counting what is
/// outstanding, and that can be told to fail.
pub struct CountingSource {
    fetches: AtomicUsize,
    byte_allocations: AtomicUsize,
    outstanding_pages: AtomicUsize,
    outstanding_bytes: AtomicUsize,
    /// Successful fetches left before every fetch fails. `usize::MAX` means
    /// never fail.
    fetch_budget: AtomicUsize,
    fail_returns: AtomicBool,
    live_pages: Mutex<Vec<(usize, usize)>>,
}

impl CountingSource {
    pub fn new() -> Self {
        Self {
            fetches: AtomicUsize::new(0),
            byte_allocations: AtomicUsize::new(0),
            outstanding_pages: AtomicUsize::new(0),
            outstanding_bytes: AtomicUsize::new(0),
            fetch_budget: AtomicUsize::new(usize::MAX),
            fail_returns: AtomicBool::new(false),
            live_pages: Mutex::new(Vec::new()),
        }
    }

    /// Lets `successes` more page fetches or byte allocations through, then
    /// fails every following one.
    pub fn fail_fetch_after(&self, successes: usize) {
        self.fetch_budget.store(successes, Ordering::SeqCst);
    }

    pub fn fail_returns(&self, fail: bool) {
        self.fail_returns.store(fail, Ordering::SeqCst);
    }

    /// Successful page fetches so far.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Successful byte allocations so far.
    pub fn byte_allocations(&self) -> usize {
        self.byte_allocations.load(Ordering::SeqCst)
    }

    pub fn outstanding_pages(&self) -> usize {
        self.outstanding_pages.load(Ordering::SeqCst)
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes.load(Ordering::SeqCst)
    }

    /// Unmaps every page range still outstanding, for tests that leak on
    /// purpose.
    pub fn reclaim_all(&self) {
        let live = std::mem::take(&mut *self.live_pages.lock().unwrap());

        for (base, len) in live {
            let region = Region::new(NonNull::new(base as *mut u8).unwrap(), len);
            unsafe { Kernel.return_pages(region).unwrap() };
            self.outstanding_pages
                .fetch_sub(len / Kernel.page_size(), Ordering::SeqCst);
        }
    }

    fn take_budget(&self) -> Result<()> {
        self.fetch_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| match budget {
                0 => None,
                usize::MAX => Some(usize::MAX),
                budget => Some(budget - 1),
            })
            .map(|_| ())
            .map_err(|_| Error::Internal)
    }
}

impl MemorySource for CountingSource {
    fn page_size(&self) -> usize {
        Kernel.page_size()
    }

    fn fetch_pages(&self, count: usize) -> Result<Region> {
        self.take_budget()?;

        let region = Kernel.fetch_pages(count)?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.outstanding_pages.fetch_add(count, Ordering::SeqCst);
        self.live_pages
            .lock()
            .unwrap()
            .push((region.base.as_ptr() as usize, region.len));

        Ok(region)
    }

    unsafe fn return_pages(&self, region: Region) -> Result<()> {
        if self.fail_returns.load(Ordering::SeqCst) {
            return Err(Error::Internal);
        }

        unsafe { Kernel.return_pages(region)? };
        self.outstanding_pages
            .fetch_sub(region.pages(Kernel.page_size()), Ordering::SeqCst);
        self.live_pages
            .lock()
            .unwrap()
            .retain(|(base, _)| *base != region.base.as_ptr() as usize);

        Ok(())
    }

    fn allocate_bytes(&self, size: usize, align: usize) -> Result<Region> {
        self.take_budget()?;

        let region = Kernel.allocate_bytes(size, align)?;
        self.byte_allocations.fetch_add(1, Ordering::SeqCst);
        self.outstanding_bytes.fetch_add(size, Ordering::SeqCst);

        Ok(region)
    }

    unsafe fn release_bytes(&self, region: Region, align: usize) -> Result<()> {
        if self.fail_returns.load(Ordering::SeqCst) {
            return Err(Error::Internal);
        }

        unsafe { Kernel.release_bytes(region, align)? };
        self.outstanding_bytes.fetch_sub(region.len, Ordering::SeqCst);

        Ok(())
    }
}
