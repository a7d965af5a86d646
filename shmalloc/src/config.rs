//! Configuration of the Linux platform.

use std::env;

use log::warn;

use shmalloc_core::{parse_size, Configuration};

/// Name of the environment variable overriding `default_backend_size`.
pub const BACKEND_SIZE_VARIABLE: &str = "SHMALLOC_BACKEND_SIZE";

/// Implementation of the Configuration trait, for Linux.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShmConfiguration;

impl Configuration for ShmConfiguration {
    const MAX_BACKENDS: usize = 128;

    const MAX_ALLOCATORS: usize = 1024;

    const MINORS_PER_MAJOR: usize = 8;

    //  1 MB
    const ROOT_REGION_SIZE: usize = 1024 * 1024;
}

/// Returns the default size of a backend, in bytes.
///
/// The size is read from the `SHMALLOC_BACKEND_SIZE` environment variable, such as `512M` or `4g`, and otherwise is the
/// size of the physical memory.
pub fn default_backend_size() -> usize {
    if let Ok(text) = env::var(BACKEND_SIZE_VARIABLE) {
        match parse_size(&text) {
            Ok(size) => return usize::try_from(size).unwrap_or(usize::MAX),
            Err(error) => warn!("Ignoring {}={:?}: {}", BACKEND_SIZE_VARIABLE, text, error),
        }
    }

    physical_memory()
}

fn physical_memory() -> usize {
    //  Safety:
    //  -   `sysconf` has no precondition.
    let (pages, page_size) = unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };

    if pages <= 0 || page_size <= 0 {
        warn!("Could not query the size of the physical memory");
        return 0;
    }

    (pages as usize).saturating_mul(page_size as usize)
}
