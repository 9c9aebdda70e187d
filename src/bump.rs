use std::{mem, ptr::NonNull};

use crate::{
    error::{Error, Result},
    kernel::{Kernel, MemorySource},
    list::{self, HEADER_SIZE, Header, Link},
    options::Options,
    utils::{align_up, checked_align_up},
};

/// Header placed at the start of every chunk.
type ChunkHeader = Header;

/// Arena allocator: hands out consecutive slices of a chunk and only ever
/// frees everything at once.
///
/// ```text
///   chunks                                        current
///     |                                              |
///     v                                              v
///   +--------+--------------------------+        +--------+-------------+---------------+
///   | Header | A1 | A2 | A3 |   unused  |  --->  | Header | A4 | A5 |  |     free      |
///   +--------+--------------------------+        +--------+-------------+---------------+
///            |<------- capacity ------->|                 |<-offset->|
/// ```
///
/// When the current chunk cannot fit a request, a new chunk is linked after
/// it if the options allow growth; otherwise the request fails. No request
/// may exceed one chunk's capacity. Chunks come straight from the
/// [`MemorySource`]: whole pages when the chunk size is a multiple of the page
/// size, an aligned byte allocation otherwise.
///
/// Not thread safe; callers that share it must lock around it.
///
/// ```
/// use layeralloc::{Bump, Options};
///
/// let mut arena = Bump::new(Options::new().size(1024));
/// let a = arena.allocate(24).unwrap();
/// let b = arena.allocate(24).unwrap();
/// assert!(b.as_ptr() > a.as_ptr());
///
/// arena.reset().unwrap();
/// ```
pub struct Bump<M: MemorySource = Kernel> {
    source: M,
    options: Options,
    /// Offset of the next free byte within the current chunk's payload.
    offset: usize,
    /// First chunk of the list, `None` while the arena is empty.
    chunks: Link<ChunkHeader>,
    current: Link<ChunkHeader>,
}

impl Bump<Kernel> {
    pub fn new(options: Options) -> Self {
        Self::with_source(Kernel, options)
    }
}

impl Default for Bump<Kernel> {
    fn default() -> Self {
        Self::new(Options::new())
    }
}

impl<M: MemorySource> Bump<M> {
    pub fn with_source(source: M, options: Options) -> Self {
        Self {
            source,
            options,
            offset: 0,
            chunks: None,
            current: None,
        }
    }

    #[inline]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Distance from a chunk's base to its first usable byte: the header,
    /// rounded up so that the payload starts aligned.
    #[inline]
    fn payload_offset(&self) -> usize {
        align_up(HEADER_SIZE, self.options.alignment_value())
    }

    /// Size of every chunk, header included. `None` if the configured size
    /// overflows once the header is added, in which case nothing can be
    /// allocated.
    #[inline]
    pub fn aligned_size(&self) -> Option<usize> {
        self.options.aligned_size(self.payload_offset())
    }

    /// Usable bytes of a chunk. Upper bound for any single request.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.aligned_size()
            .map_or(0, |size| size.saturating_sub(self.payload_offset()))
    }

    /// Whether chunks are mapped as whole pages rather than byte allocations.
    /// Pages are only aligned to the page size, so a larger alignment always
    /// takes the byte path.
    pub fn is_page_multiple(&self) -> bool {
        let page_size = self.source.page_size();

        match self.aligned_size() {
            Some(size) => {
                self.options.alignment_value() <= page_size
                    && size > page_size
                    && size % page_size == 0
            }
            None => false,
        }
    }

    /// Number of chunks currently held.
    pub fn chunk_count(&self) -> usize {
        unsafe { list::iter(self.chunks, None) }.count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_none()
    }

    /// Returns `n` bytes aligned to the configured alignment, or `None` if
    /// `n` exceeds [`Bump::capacity`], if the current chunk is full and growth
    /// is disabled, or if a new chunk cannot be acquired.
    pub fn allocate(&mut self, n: usize) -> Option<NonNull<u8>> {
        let capacity = self.capacity();
        if n > capacity {
            return None;
        }

        let mut current = match self.current {
            Some(current) => current,
            None => {
                let chunk = self.allocate_new_chunk()?;
                self.chunks = Some(chunk);
                self.current = Some(chunk);
                self.offset = 0;
                chunk
            }
        };

        let request_size = align_up(n, self.options.alignment_value());
        let remaining_size = capacity - self.offset;

        if request_size > remaining_size {
            if !self.options.grow_when_full() {
                return None;
            }

            let chunk = self.allocate_new_chunk()?;

            unsafe { current.as_mut().next = Some(chunk) };
            self.current = Some(chunk);
            self.offset = 0;
            current = chunk;
        }

        // SAFETY: `offset + request_size <= capacity`, so the result stays in
        // the chunk's payload.
        let result = unsafe { Header::payload(current, self.payload_offset() + self.offset) };
        self.offset += request_size;

        Some(result)
    }

    /// Room for `count` values of `T`. Fails if `T` needs more alignment than
    /// the arena provides.
    pub fn allocate_array<T>(&mut self, count: usize) -> Option<NonNull<T>> {
        if mem::align_of::<T>() > self.options.alignment_value() {
            return None;
        }

        let size = mem::size_of::<T>().checked_mul(count)?;
        checked_align_up(size, self.options.alignment_value())?;

        self.allocate(size).map(NonNull::cast)
    }

    /// Individual regions are never reclaimed; see [`Bump::reset`].
    #[inline]
    pub fn deallocate(&mut self, _ptr: NonNull<u8>, _n: usize) {}

    /// Gives every chunk back and returns the arena to its empty state, as if
    /// newly built. Safe to call on an empty arena.
    ///
    /// If a chunk cannot be returned, the walk stops, the remaining chunks
    /// are leaked and [`Error::Internal`] is reported; the arena is empty
    /// either way.
    pub fn reset(&mut self) -> Result<()> {
        self.offset = 0;
        self.current = None;

        let Some(chunks) = self.chunks.take() else {
            return Ok(());
        };

        let page_multiple = self.is_page_multiple();
        let alignment = self.options.alignment_value();
        let source = &self.source;

        let release = |chunk: NonNull<ChunkHeader>| unsafe {
            let region = Header::region(chunk);
            if page_multiple {
                source.return_pages(region)
            } else {
                source.release_bytes(region, alignment)
            }
        };

        unsafe { list::release_list(Some(chunks), None, release) }.map_err(|_| Error::Internal)
    }

    fn allocate_new_chunk(&self) -> Option<NonNull<ChunkHeader>> {
        let size = self.aligned_size()?;
        if size <= self.payload_offset() {
            return None;
        }

        let allocation = if self.is_page_multiple() {
            self.source.fetch_pages(size / self.source.page_size())
        } else {
            self.source.allocate_bytes(size, self.options.alignment_value())
        };

        match allocation {
            // SAFETY: fresh, writable and aligned to at least `alignment`.
            Ok(region) => Some(unsafe { Header::create(region, None) }),
            Err(err) => {
                tracing::warn!(size, error = %err, "failed to acquire bump chunk");
                None
            }
        }
    }
}

impl<M: MemorySource> Drop for Bump<M> {
    fn drop(&mut self) {
        if let Err(err) = self.reset() {
            tracing::error!(error = %err, "failed to release bump chunks on drop");
        }
    }
}
