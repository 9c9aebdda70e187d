use std::{marker::PhantomData, mem, ptr::NonNull};

use crate::{
    error::{Error, Result},
    region::Region,
};

/// Non-null pointer to `T`.
pub type Link<T> = Option<NonNull<T>>;

/// Size of the intrusive [`Header`] placed at the start of every block/chunk.
pub const HEADER_SIZE: usize = mem::size_of::<Header>();

/// Header written in place at the base of every block or chunk. Headers link
/// same-kind regions into a singly linked list owned by one allocator.
///
/// ```text
///         +---------------------------+        +---------------------------+
///         | size | next  |   payload  |  --->  | size | next  |   payload  |  ---> None
///         +---------------------------+        +---------------------------+
///         ^                                    ^
///   region.base                          region.base
/// ```
///
/// The list never allocates: every node lives inside the memory it describes,
/// so its address stays stable until that memory is given back.
#[repr(C)]
#[derive(Debug)]
pub struct Header {
    /// Size in bytes of the whole region, header included.
    pub size: usize,
    /// Next region of the list.
    pub next: Link<Header>,
}

impl Header {
    /// Writes a new header at `region.base` that links to `next`.
    ///
    /// **SAFETY**: `region` must be writable, at least [`HEADER_SIZE`] bytes
    /// long and aligned for `Header`.
    pub unsafe fn create(region: Region, next: Link<Header>) -> NonNull<Header> {
        debug_assert!(region.len >= HEADER_SIZE);
        debug_assert_eq!(region.base.as_ptr() as usize % mem::align_of::<Header>(), 0);

        let header = region.base.cast::<Header>();

        unsafe {
            header.as_ptr().write(Header {
                size: region.len,
                next,
            });
        }

        header
    }

    /// Region described by `header`.
    ///
    /// **SAFETY**: `header` must point to a live header.
    #[inline]
    pub unsafe fn region(header: NonNull<Header>) -> Region {
        unsafe { Region::new(header.cast::<u8>(), header.as_ref().size) }
    }

    /// First usable byte of the region, `offset` bytes past its base.
    ///
    /// **SAFETY**: `offset` must be within the region described by `header`.
    #[inline]
    pub unsafe fn payload(header: NonNull<Header>, offset: usize) -> NonNull<u8> {
        unsafe { header.cast::<u8>().add(offset) }
    }
}

pub struct Iter<'a> {
    current: Link<Header>,
    sentinel: Link<Header>,
    marker: PhantomData<&'a Header>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = NonNull<Header>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;

        if self.current == self.sentinel {
            return None;
        }

        unsafe {
            self.current = node.as_ref().next;
        }

        Some(node)
    }
}

/// Iterates the list from `head` up to, but excluding, `sentinel`.
///
/// **SAFETY**: every header reachable from `head` before `sentinel` must stay
/// alive while the iterator is used.
pub unsafe fn iter<'a>(head: Link<Header>, sentinel: Link<Header>) -> Iter<'a> {
    Iter {
        current: head,
        sentinel,
        marker: PhantomData,
    }
}

/// Walks the list from `head` up to, but excluding, `sentinel`, handing each
/// header to `release`. The `next` link is read before `release` runs, so the
/// callback is free to give the memory back.
///
/// The walk stops at the first failure and reports [`Error::ReleaseFailed`];
/// headers after the failing one are left untouched.
///
/// **SAFETY**: same as [`iter`], and no header may be used again after
/// `release` accepted it.
pub unsafe fn release_list<F>(head: Link<Header>, sentinel: Link<Header>, mut release: F) -> Result<()>
where
    F: FnMut(NonNull<Header>) -> Result<()>,
{
    let mut current = head;

    while let Some(node) = current {
        if current == sentinel {
            break;
        }

        unsafe {
            current = node.as_ref().next;
        }

        if let Err(err) = release(node) {
            tracing::error!(header = ?node, error = %err, "failed to release list node");
            return Err(Error::ReleaseFailed);
        }
    }

    Ok(())
}
