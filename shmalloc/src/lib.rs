#![deny(missing_docs)]

//! Shared-memory allocators, for Linux.
//!
//! The process-wide `MemoryManager`, returned by `memory_manager()`, registers the backends and allocators of the
//! process: backends are created over anonymous memory, POSIX shared memory segments, memory-mapped files, or the
//! memory of accelerator devices, and other processes attach them by name to discover the allocators within.
//!
//! All the building blocks of `shmalloc-core` are re-exported.

pub mod config;

mod platform;

pub use shmalloc_core::*;

pub use config::{default_backend_size, ShmConfiguration};
pub use platform::{EmulatedDevices, ShmPlatform, ShmThreadModel};

use std::sync::{Arc, OnceLock};

use log::error;

static MEMORY_MANAGER: OnceLock<MemoryManager<ShmConfiguration>> = OnceLock::new();

/// Initializes the process-wide MemoryManager, if not already initialized, and returns it.
///
/// #   Panics
///
/// If the root backend cannot be allocated.
pub fn init() -> &'static MemoryManager<ShmConfiguration> { memory_manager() }

/// Returns the process-wide MemoryManager, initializing it on first use.
///
/// The MemoryManager lives until the process exits.
///
/// #   Panics
///
/// If the root backend cannot be allocated.
pub fn memory_manager() -> &'static MemoryManager<ShmConfiguration> {
    MEMORY_MANAGER.get_or_init(|| match MemoryManager::new(Arc::new(ShmPlatform::new())) {
        Ok(manager) => manager,
        Err(error) => {
            error!("Could not initialize the memory manager: {}", error);
            panic!("Could not initialize the memory manager: {}", error);
        },
    })
}
