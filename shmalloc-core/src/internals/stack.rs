//! Lock-free bump allocation.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{Error, OffsetPointer, PowerOf2, Result};

use super::{
    header::{AllocatorBase, BLOCK_ALIGNMENT},
    page::{Page, PAGE_SIZE},
};

//  A bump cursor over `[cursor, end)`.
#[repr(C)]
pub(crate) struct StackCore {
    cursor: AtomicU64,
    end: AtomicU64,
}

impl StackCore {
    pub(crate) fn init(&self, start: u64, end: u64) {
        self.end.store(end, Ordering::Relaxed);
        self.cursor.store(start, Ordering::Release);
    }

    //  Reserves `prefix + size` bytes, such that the offset following the prefix is a multiple of `alignment`.
    //
    //  Returns the offset following the prefix; `size` is rounded up to the alignment of blocks, and any overflow is
    //  reported as `OutOfMemory`.
    pub(crate) fn allocate(&self, prefix: u64, size: u64, alignment: PowerOf2) -> Result<u64> {
        let end = self.end.load(Ordering::Relaxed);
        let rounded = BLOCK_ALIGNMENT.checked_round_up_offset(size);

        let mut current = self.cursor.load(Ordering::Acquire);

        loop {
            let next = rounded.and_then(|size| {
                let start = current.checked_add(prefix).and_then(|offset| alignment.checked_round_up_offset(offset))?;
                start.checked_add(size).filter(|next| *next <= end).map(|next| (start, next))
            });

            let (start, next) = match next {
                Some(next) => next,
                None => {
                    let requested = rounded.and_then(|size| size.checked_add(prefix))
                        .and_then(|requested| usize::try_from(requested).ok())
                        .unwrap_or(usize::MAX);
                    let available = end.saturating_sub(current) as usize;
                    return Err(Error::OutOfMemory { requested, available });
                },
            };

            match self.cursor.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(start),
                Err(actual) => current = actual,
            }
        }
    }
}

//  Variant header of the Stack allocator.
#[repr(C)]
pub(crate) struct StackHeader {
    stack: StackCore,
}

//  Bump allocator: blocks are never reused.
pub(crate) struct Stack;

impl Stack {
    pub(crate) fn init(base: &AllocatorBase) {
        //  Safety:
        //  -   Formatted with `StackHeader`.
        let header = unsafe { base.variant::<StackHeader>() };

        header.stack.init(base.region_offset(), base.region_end());
    }

    pub(crate) fn allocate(base: &AllocatorBase, size: usize, alignment: PowerOf2) -> Result<OffsetPointer> {
        //  Safety:
        //  -   Formatted with `StackHeader`.
        let header = unsafe { base.variant::<StackHeader>() };

        let alignment = alignment.max(BLOCK_ALIGNMENT);
        let payload = header.stack.allocate(PAGE_SIZE, size as u64, alignment)?;

        //  Safety:
        //  -   The page precedes the payload, within the reserved range.
        let page = unsafe { base.at::<Page>(payload - PAGE_SIZE) };
        page.init(PAGE_SIZE + BLOCK_ALIGNMENT.round_up_offset(size as u64), size as u64, Page::ALLOCATED);

        base.add_allocated(size as u64);

        Ok(OffsetPointer::new(payload))
    }

    pub(crate) fn reallocate(base: &AllocatorBase, pointer: OffsetPointer, size: usize) -> Result<OffsetPointer> {
        let used = base.page(pointer)?.used();

        let result = Self::allocate(base, size, BLOCK_ALIGNMENT)?;

        //  Safety:
        //  -   Both blocks hold at least `min(used, size)` bytes, and are distinct.
        unsafe { base.copy(pointer.value(), result.value(), used.min(size as u64)) };

        Self::free(base, pointer)?;

        Ok(result)
    }

    pub(crate) fn free(base: &AllocatorBase, pointer: OffsetPointer) -> Result<()> {
        let page = base.page(pointer)?;

        if !page.release() {
            return Err(Error::DoubleFree(pointer));
        }

        base.sub_allocated(page.used());
        Ok(())
    }
}
