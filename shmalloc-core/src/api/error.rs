//! Errors reported by shmalloc.

use thiserror::Error;

use super::{AllocatorId, AllocatorKind, BackendId, BackendKind, OffsetPointer};

/// Result of fallible shmalloc operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error
///
/// Allocation failures and integrity violations; the absence of a backend or allocator is not an error, and is
/// reported as `None` instead.
#[derive(Debug, Error)]
pub enum Error {
    /// No block of the requested size could be produced.
    #[error("out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Number of bytes requested.
        requested: usize,
        /// Number of bytes still available in the bump region.
        available: usize,
    },

    /// The block was already free.
    #[error("double free of offset {0}")]
    DoubleFree(OffsetPointer),

    /// The offset does not designate a block of this allocator.
    #[error("invalid pointer: offset {0}")]
    InvalidPointer(OffsetPointer),

    /// The operation is not supported by this allocator.
    #[error("{operation} is not supported by the {allocator} allocator")]
    NotSupported {
        /// Name of the operation.
        operation: &'static str,
        /// Kind of the allocator.
        allocator: AllocatorKind,
    },

    /// A backend is already registered with this identifier.
    #[error("{0} is already registered")]
    BackendExists(BackendId),

    /// The identifier exceeds the capacity of the backend table.
    #[error("{0} exceeds the capacity of the backend table")]
    BackendTableFull(BackendId),

    /// The identifier exceeds the capacity of the allocator table.
    #[error("allocator {0} exceeds the capacity of the allocator table")]
    AllocatorTableFull(AllocatorId),

    /// The region is too small for the requested structure.
    #[error("region too small: {size} bytes, at least {minimum} required")]
    RegionTooSmall {
        /// Size of the region.
        size: usize,
        /// Minimum size.
        minimum: usize,
    },

    /// The region does not contain the expected header.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// The platform cannot provide this kind of backend.
    #[error("unsupported backend: {0:?}")]
    UnsupportedBackend(BackendKind),

    /// The device runtime reported a failure.
    #[error("device error: {0}")]
    Device(String),

    /// A size, latency, or locator could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// The OS reported a failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
