//! The configuration of shmalloc-core.
//!
//! The capacities of a MemoryManager are fixed at compile-time, so that its tables are plain arrays indexed by
//! identifier.

/// Configuration
///
/// The Configuration instance fixes the capacities of the MemoryManager tables.
pub trait Configuration: Send + Sync + 'static {
    /// Number of slots of the backend table; the largest valid BackendId is `MAX_BACKENDS - 1`.
    const MAX_BACKENDS: usize;

    /// Number of slots of the allocator table.
    const MAX_ALLOCATORS: usize;

    /// Number of minors of each major of an AllocatorId.
    const MINORS_PER_MAJOR: usize;

    /// Size of the region of the root backend, in bytes.
    const ROOT_REGION_SIZE: usize;
}

/// DefaultConfiguration
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultConfiguration;

impl Configuration for DefaultConfiguration {
    const MAX_BACKENDS: usize = 64;

    const MAX_ALLOCATORS: usize = 256;

    const MINORS_PER_MAJOR: usize = 4;

    //  64 KB
    const ROOT_REGION_SIZE: usize = 64 * 1024;
}
