use std::{
    alloc::{self, Layout},
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    error::{Error, Result},
    region::Region,
};

/// Virtual memory page size of the computer. This is usually 4096.
/// Zero until the first query; the OS value never changes afterwards.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Zero sized handle over the operating system's memory primitives. This is
/// the default [`MemorySource`] for every allocator in the crate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Kernel;

/// Source of raw memory consumed by the allocators.
///
/// Page-granular calls return whole, zero-filled OS pages. Byte-granular calls
/// return `size` bytes aligned to `align`. Implementations must never hand out
/// a range that aliases one that has not been returned yet.
///
/// This is also the seam tests use to count outstanding memory or to make the
/// OS "fail" on demand.
pub trait MemorySource {
    /// Returns the virtual memory page size in bytes. Constant for the process.
    fn page_size(&self) -> usize;

    /// Maps `count` contiguous pages.
    fn fetch_pages(&self, count: usize) -> Result<Region>;

    /// Unmaps pages obtained from [`MemorySource::fetch_pages`].
    ///
    /// **SAFETY**: `region` must come from `fetch_pages` on this source and must
    /// not be used after this call.
    unsafe fn return_pages(&self, region: Region) -> Result<()>;

    /// Allocates `size` bytes aligned to `align`.
    fn allocate_bytes(&self, size: usize, align: usize) -> Result<Region>;

    /// Frees memory obtained from [`MemorySource::allocate_bytes`].
    ///
    /// **SAFETY**: `region` and `align` must be exactly what `allocate_bytes`
    /// returned and was called with, and the memory must not be used after
    /// this call.
    unsafe fn release_bytes(&self, region: Region, align: usize) -> Result<()>;
}

impl<M: MemorySource + ?Sized> MemorySource for &M {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn fetch_pages(&self, count: usize) -> Result<Region> {
        (**self).fetch_pages(count)
    }

    unsafe fn return_pages(&self, region: Region) -> Result<()> {
        unsafe { (**self).return_pages(region) }
    }

    fn allocate_bytes(&self, size: usize, align: usize) -> Result<Region> {
        (**self).allocate_bytes(size, align)
    }

    unsafe fn release_bytes(&self, region: Region, align: usize) -> Result<()> {
        unsafe { (**self).release_bytes(region, align) }
    }
}

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. The allocators have nothing to do with the concrete APIs
/// offered by each kernel.
trait PlatformMemory {
    /// Request a memory region of size `len`. It returns a Pointer to the
    /// given location or None if the underlying syscall fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    /// Returns `false` if the kernel refused.
    unsafe fn return_memory(addr: *mut u8, len: usize) -> bool;

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;
}

/// Wrapper to calculate the computer's page size.
#[inline]
pub fn page_size() -> usize {
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = unsafe { <Kernel as PlatformMemory>::page_size() };
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

impl MemorySource for Kernel {
    #[inline]
    fn page_size(&self) -> usize {
        page_size()
    }

    fn fetch_pages(&self, count: usize) -> Result<Region> {
        if count == 0 {
            return Err(Error::InvalidInput);
        }

        let len = count.checked_mul(page_size()).ok_or(Error::InvalidInput)?;

        match unsafe { <Kernel as PlatformMemory>::request_memory(len) } {
            Some(base) => Ok(Region::new(base, len)),
            None => {
                tracing::error!(pages = count, "kernel refused to map pages");
                Err(Error::Internal)
            }
        }
    }

    unsafe fn return_pages(&self, region: Region) -> Result<()> {
        let returned =
            unsafe { <Kernel as PlatformMemory>::return_memory(region.base.as_ptr(), region.len) };

        if returned {
            Ok(())
        } else {
            tracing::error!(
                base = ?region.base,
                pages = region.pages(page_size()),
                "kernel refused to unmap pages"
            );
            Err(Error::Internal)
        }
    }

    fn allocate_bytes(&self, size: usize, align: usize) -> Result<Region> {
        if size == 0 {
            return Err(Error::InvalidInput);
        }

        let layout = Layout::from_size_align(size, align).map_err(|_| Error::InvalidInput)?;

        // SAFETY: `layout` has a non zero size.
        let addr = unsafe { alloc::alloc(layout) };

        NonNull::new(addr)
            .map(|base| Region::new(base, size))
            .ok_or(Error::Internal)
    }

    unsafe fn release_bytes(&self, region: Region, align: usize) -> Result<()> {
        let layout = Layout::from_size_align(region.len, align).map_err(|_| Error::InvalidInput)?;

        // SAFETY: caller guarantees `region` was allocated with this layout.
        unsafe { alloc::dealloc(region.base.as_ptr(), layout) };

        Ok(())
    }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                if addr == libc::MAP_FAILED {
                    return None;
                }

                NonNull::new(addr.cast::<u8>())
            }
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) -> bool {
            unsafe { munmap(addr.cast::<c_void>(), len as size_t) == 0 }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{Kernel, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: *mut u8, _len: usize) -> bool {
            // MEM_RELEASE frees the whole reservation and requires a zero size.
            unsafe { Memory::VirtualFree(addr.cast::<c_void>(), 0, Memory::MEM_RELEASE).is_ok() }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}
