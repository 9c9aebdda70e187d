/// Errors returned by every fallible operation in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Error {
    /// A caller-supplied argument violates a precondition: zero or over-limit
    /// page count, null pointer, address that was never handed out.
    #[error("invalid input")]
    InvalidInput,
    /// An underlying provider or OS call failed.
    #[error("internal allocator failure")]
    Internal,
    /// Returning one of the regions of a list walk failed.
    #[error("release failed")]
    ReleaseFailed,
}

pub type Result<T> = core::result::Result<T, Error>;
