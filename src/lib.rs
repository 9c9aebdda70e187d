//! Composable allocators layered over raw OS pages.
//!
//! ```text
//!   +-----------+     +-----------+
//!   |   Block   |     |   Bump    |      fixed-size blocks / arena
//!   +-----------+     +-----------+
//!         |                 |
//!         v (Provider)      |
//!   +-----------+           |
//!   |   Page    |           |            lock-free page allocator
//!   +-----------+           |
//!         |                 |
//!         v                 v (MemorySource)
//!   +-----------------------------+
//!   |           Kernel            |      mmap / VirtualAlloc
//!   +-----------------------------+
//! ```
//!
//! * [`Page`] hands out whole pages and tracks each allocation in a lock-free
//!   registry, so it can be shared between threads.
//! * [`Block`] hands out fixed-size, aligned blocks with an intrusive header,
//!   sourced from any [`Provider`] (a [`Page`] allocator by default).
//! * [`Bump`] is an arena over a chain of chunks: allocation moves an offset
//!   forward and memory is only released all at once.
//!
//! [`Block`] and [`Bump`] are configured with an immutable [`Options`] value
//! and are not thread safe.

mod block;
mod bump;
mod error;
pub mod kernel;
pub mod list;
mod options;
pub mod page;
mod provider;
mod region;
pub mod utils;

#[cfg(test)]
mod testing;

pub use block::{BLOCK_HEADER_SIZE, Block, BlockHeader};
pub use bump::Bump;
pub use error::{Error, Result};
pub use kernel::{Kernel, MemorySource};
pub use options::{DEFAULT_SIZE, Limit, MIN_ALIGNMENT, Options, WhenFull};
pub use page::Page;
pub use provider::Provider;
pub use region::Region;
