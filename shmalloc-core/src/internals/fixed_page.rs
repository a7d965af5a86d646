//! Free-list allocator over lazily discovered block sizes.
//!
//! Freed blocks are kept in homogeneous FIFO free lists, one per distinct block size ever allocated. The descriptor of
//! a list is carved out of the allocatable region along with the first block of its size, and descriptors are chained
//! in order of creation. Hence freeing a block never requires memory.

use core::{
    mem,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{Error, OffsetPointer, Result};

use super::{
    header::{AllocatorBase, BLOCK_ALIGNMENT},
    page::{Page, PAGE_SIZE},
    spin_lock::SpinLock,
    stack::StackCore,
};

const NULL: u64 = u64::MAX;

const LIST_SIZE: u64 = mem::size_of::<FreeList>() as u64;

//  Variant header of the FixedPage allocator.
#[repr(C)]
pub(crate) struct FixedPageHeader {
    lock: SpinLock,
    stack: StackCore,
    free_lists: AtomicU64,
}

//  Descriptor of a free list; all its blocks are `block_size` bytes, header included.
#[repr(C)]
struct FreeList {
    block_size: AtomicU64,
    head: AtomicU64,
    tail: AtomicU64,
    len: AtomicU64,
    next: AtomicU64,
}

pub(crate) struct FixedPage;

impl FixedPage {
    pub(crate) fn init(base: &AllocatorBase) {
        let header = Self::header(base);

        header.lock.init();
        header.stack.init(base.region_offset(), base.region_end());
        header.free_lists.store(NULL, Ordering::Release);
    }

    pub(crate) fn allocate(base: &AllocatorBase, size: usize) -> Result<OffsetPointer> {
        let header = Self::header(base);
        let block_size = Self::block_size(size)
            .ok_or(Error::OutOfMemory { requested: size, available: 0 })?;

        let _guard = header.lock.lock(base.thread_model());

        let page_offset = match Self::find_list(base, header, block_size) {
            Some(list) => match Self::pop_front(base, list) {
                Some(offset) => offset,
                None => header.stack.allocate(PAGE_SIZE, size as u64, BLOCK_ALIGNMENT)? - PAGE_SIZE,
            },
            //  The descriptor is reserved in front of the first block of its size, in a single bump.
            None => {
                let prefix = LIST_SIZE + PAGE_SIZE;
                let payload = header.stack.allocate(prefix, size as u64, BLOCK_ALIGNMENT)?;

                Self::push_list(base, header, payload - prefix, block_size);
                payload - PAGE_SIZE
            },
        };

        //  Safety:
        //  -   `page_offset` designates a block of `block_size` bytes, exclusively owned.
        let page = unsafe { base.at::<Page>(page_offset) };
        page.init(block_size, size as u64, Page::ALLOCATED);

        base.add_allocated(size as u64);

        Ok(OffsetPointer::new(page_offset + PAGE_SIZE))
    }

    pub(crate) fn free(base: &AllocatorBase, pointer: OffsetPointer) -> Result<()> {
        let header = Self::header(base);
        let page = base.page(pointer)?;

        let _guard = header.lock.lock(base.thread_model());

        if !page.is_allocated() {
            return Err(Error::DoubleFree(pointer));
        }

        //  Every block size handed out has its list.
        let list = Self::find_list(base, header, page.size()).ok_or(Error::InvalidPointer(pointer))?;

        if !page.release() {
            return Err(Error::DoubleFree(pointer));
        }

        base.sub_allocated(page.used());
        Self::push_back(base, list, pointer.value() - PAGE_SIZE);

        Ok(())
    }

    fn block_size(size: usize) -> Option<u64> {
        BLOCK_ALIGNMENT.checked_round_up_offset(size as u64)?.checked_add(PAGE_SIZE)
    }

    fn header(base: &AllocatorBase) -> &FixedPageHeader {
        //  Safety:
        //  -   Formatted with `FixedPageHeader`.
        unsafe { base.variant::<FixedPageHeader>() }
    }

    fn list(base: &AllocatorBase, offset: u64) -> &FreeList {
        //  Safety:
        //  -   `offset` was formatted by `push_list`.
        unsafe { base.at::<FreeList>(offset) }
    }

    //  Returns the first list of blocks of exactly `block_size` bytes.
    //
    //  Assumes the lock is held.
    fn find_list<'a>(base: &'a AllocatorBase, header: &FixedPageHeader, block_size: u64) -> Option<&'a FreeList> {
        let mut current = header.free_lists.load(Ordering::Relaxed);

        while current != NULL {
            let list = Self::list(base, current);

            if list.block_size.load(Ordering::Relaxed) == block_size {
                return Some(list);
            }

            current = list.next.load(Ordering::Relaxed);
        }

        None
    }

    //  Formats a new, empty, list of blocks of `block_size` bytes at `offset`, and appends it to the table.
    //
    //  Assumes the lock is held, and `offset` reserved for a descriptor.
    fn push_list(base: &AllocatorBase, header: &FixedPageHeader, offset: u64, block_size: u64) {
        let list = Self::list(base, offset);
        list.block_size.store(block_size, Ordering::Relaxed);
        list.head.store(NULL, Ordering::Relaxed);
        list.tail.store(NULL, Ordering::Relaxed);
        list.len.store(0, Ordering::Relaxed);
        list.next.store(NULL, Ordering::Relaxed);

        let mut link = &header.free_lists;

        loop {
            let current = link.load(Ordering::Relaxed);

            if current == NULL {
                break;
            }

            link = &Self::list(base, current).next;
        }

        link.store(offset, Ordering::Relaxed);
    }

    //  Assumes the lock is held.
    fn pop_front(base: &AllocatorBase, list: &FreeList) -> Option<u64> {
        let head = list.head.load(Ordering::Relaxed);

        if head == NULL {
            return None;
        }

        //  Safety:
        //  -   Blocks of the list are valid pages.
        let next = unsafe { base.at::<Page>(head) }.next();

        list.head.store(next, Ordering::Relaxed);

        if next == NULL {
            list.tail.store(NULL, Ordering::Relaxed);
        }

        list.len.fetch_sub(1, Ordering::Relaxed);

        Some(head)
    }

    //  Assumes the lock is held.
    fn push_back(base: &AllocatorBase, list: &FreeList, page_offset: u64) {
        //  Safety:
        //  -   `page_offset` designates a valid page, just released.
        unsafe { base.at::<Page>(page_offset) }.set_next(NULL);

        let tail = list.tail.load(Ordering::Relaxed);

        if tail == NULL {
            list.head.store(page_offset, Ordering::Relaxed);
        } else {
            //  Safety:
            //  -   Blocks of the list are valid pages.
            unsafe { base.at::<Page>(tail) }.set_next(page_offset);
        }

        list.tail.store(page_offset, Ordering::Relaxed);
        list.len.fetch_add(1, Ordering::Relaxed);
    }
}
