//! Internal structures, formatted within the regions of backends.
//!
//! All these structures are accessed concurrently, possibly from several address spaces, and therefore only contain
//! atomics and offsets relative to the base of their backend.

pub(crate) mod fixed_page;
pub(crate) mod header;
pub(crate) mod malloc;
pub(crate) mod page;
pub(crate) mod scalable;
pub(crate) mod spin_lock;
pub(crate) mod stack;
