//! Header preceding each block.

use core::sync::atomic::{AtomicU64, Ordering};

/// Size of the header of a block, in bytes.
pub(crate) const PAGE_SIZE: u64 = 32;

//  Header of a block: immediately precedes the payload.
//
//  `size` is the size of the block, header included; `used` the size requested by the user. `next` links free blocks
//  together, or points to the actual block of an aligned allocation.
#[repr(C)]
pub(crate) struct Page {
    size: AtomicU64,
    used: AtomicU64,
    flags: AtomicU64,
    next: AtomicU64,
}

impl Page {
    pub(crate) const ALLOCATED: u64 = 1 << 0;
    pub(crate) const ALIGNED_SHIM: u64 = 1 << 1;

    pub(crate) fn init(&self, size: u64, used: u64, flags: u64) {
        self.size.store(size, Ordering::Relaxed);
        self.used.store(used, Ordering::Relaxed);
        self.next.store(u64::MAX, Ordering::Relaxed);
        self.flags.store(flags, Ordering::Release);
    }

    pub(crate) fn size(&self) -> u64 { self.size.load(Ordering::Relaxed) }

    pub(crate) fn used(&self) -> u64 { self.used.load(Ordering::Relaxed) }

    pub(crate) fn set_used(&self, used: u64) { self.used.store(used, Ordering::Relaxed) }

    pub(crate) fn next(&self) -> u64 { self.next.load(Ordering::Relaxed) }

    pub(crate) fn set_next(&self, next: u64) { self.next.store(next, Ordering::Relaxed) }

    pub(crate) fn is_allocated(&self) -> bool { self.flags.load(Ordering::Acquire) & Self::ALLOCATED != 0 }

    pub(crate) fn is_shim(&self) -> bool { self.flags.load(Ordering::Acquire) & Self::ALIGNED_SHIM != 0 }

    //  Clears the allocated bit, returns whether it was set.
    //
    //  Of two racing calls, only one returns true.
    pub(crate) fn release(&self) -> bool {
        self.flags.fetch_and(!Self::ALLOCATED, Ordering::AcqRel) & Self::ALLOCATED != 0
    }
}

const _: () = assert!(core::mem::size_of::<Page>() as u64 == PAGE_SIZE);
