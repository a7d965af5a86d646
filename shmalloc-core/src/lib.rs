#![deny(missing_docs)]

//! Building blocks for a shared-memory allocation framework.
//!
//! shmalloc-core lets independent processes, threads, and accelerator devices allocate, locate, and free objects
//! inside memory regions which may be mapped at a different base address in each address space. It contains:
//!
//! -   A platform trait, used to create or open the raw regions ("backends") to be carved up.
//! -   A handful of allocators living _inside_ those regions, so that any participant attaching the region can
//!     discover and use them.
//! -   A pointer model expressed relative to the region base, and a memory manager translating it to local
//!     addresses.

mod api;
mod internals;
mod utils;

pub use api::*;
pub use utils::{parse_latency, parse_size, PowerOf2};
