//! General-purpose allocator over power-of-2 size classes.
//!
//! Blocks, header included, are rounded up to a power of 2 of at least 64 bytes. Freed blocks are kept in one LIFO
//! list per class; a class without free block falls back to the bump region.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{Error, OffsetPointer, PowerOf2, Result};

use super::{
    header::{AllocatorBase, BLOCK_ALIGNMENT},
    page::{Page, PAGE_SIZE},
    spin_lock::SpinLock,
    stack::StackCore,
};

const NULL: u64 = u64::MAX;

//  Safety:
//  -   64 is a power of 2.
const MINIMUM_CLASS: PowerOf2 = unsafe { PowerOf2::new_unchecked(64) };

const NUMBER_CLASSES: usize = 40;

//  Variant header of the Scalable allocator.
#[repr(C)]
pub(crate) struct ScalableHeader {
    lock: SpinLock,
    stack: StackCore,
    classes: [AtomicU64; NUMBER_CLASSES],
}

pub(crate) struct Scalable;

impl Scalable {
    pub(crate) fn init(base: &AllocatorBase) {
        let header = Self::header(base);

        header.lock.init();
        header.stack.init(base.region_offset(), base.region_end());

        for class in &header.classes {
            class.store(NULL, Ordering::Relaxed);
        }
    }

    pub(crate) fn allocate(base: &AllocatorBase, size: usize) -> Result<OffsetPointer> {
        let payload = Self::allocate_block(base, size as u64)?;

        base.add_allocated(size as u64);

        Ok(OffsetPointer::new(payload))
    }

    //  Over-allocates, then places a shim page in front of the aligned payload, pointing back to the actual block.
    pub(crate) fn aligned_allocate(base: &AllocatorBase, size: usize, alignment: PowerOf2) -> Result<OffsetPointer> {
        if alignment <= BLOCK_ALIGNMENT {
            return Self::allocate(base, size);
        }

        let size = size as u64;
        let padded = size.checked_add(alignment.value() as u64 + PAGE_SIZE)
            .ok_or(Error::OutOfMemory { requested: usize::MAX, available: 0 })?;
        let block = Self::allocate_block(base, padded)?;
        let payload = alignment.round_up_offset(block + PAGE_SIZE);

        //  Safety:
        //  -   The shim lies within the payload of `block`, as `block <= payload - PAGE_SIZE`.
        let shim = unsafe { base.at::<Page>(payload - PAGE_SIZE) };
        shim.init(0, size, Page::ALLOCATED | Page::ALIGNED_SHIM);
        shim.set_next(block);

        base.add_allocated(size);

        Ok(OffsetPointer::new(payload))
    }

    pub(crate) fn reallocate(base: &AllocatorBase, pointer: OffsetPointer, size: usize) -> Result<OffsetPointer> {
        let page = base.page(pointer)?;

        if !page.is_allocated() {
            return Err(Error::InvalidPointer(pointer));
        }

        let used = page.used();

        let fits = (size as u64).checked_add(PAGE_SIZE).map_or(false, |block| block <= page.size());

        if !page.is_shim() && fits {
            page.set_used(size as u64);
            base.add_allocated(size as u64);
            base.sub_allocated(used);
            return Ok(pointer);
        }

        let result = Self::allocate(base, size)?;

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

        if !page.is_shim() {
            return Self::free_block(base, pointer.value());
        }

        let block = OffsetPointer::new(page.next());
        let actual = base.page(block)?;

        if !actual.release() {
            return Err(Error::DoubleFree(block));
        }

        Self::free_block(base, block.value())
    }

    fn header(base: &AllocatorBase) -> &ScalableHeader {
        //  Safety:
        //  -   Formatted with `ScalableHeader`.
        unsafe { base.variant::<ScalableHeader>() }
    }

    //  Returns the index and size of the class of blocks holding `payload` bytes.
    fn class_of(payload: u64) -> Option<(usize, PowerOf2)> {
        let block = usize::try_from(payload.checked_add(PAGE_SIZE)?).ok()?;
        let class = PowerOf2::from_size(block)?.max(MINIMUM_CLASS);
        let index = class.log2() - MINIMUM_CLASS.log2();

        if index < NUMBER_CLASSES { Some((index, class)) } else { None }
    }

    //  Returns the payload offset of a block of at least `payload` bytes, without accounting for it.
    fn allocate_block(base: &AllocatorBase, payload: u64) -> Result<u64> {
        let out_of_memory = || Error::OutOfMemory { requested: payload as usize, available: 0 };

        let (index, class) = Self::class_of(payload).ok_or_else(out_of_memory)?;
        let header = Self::header(base);

        let page_offset = {
            let _guard = header.lock.lock(base.thread_model());

            let head = header.classes[index].load(Ordering::Relaxed);

            if head != NULL {
                //  Safety:
                //  -   Blocks of the list are valid pages.
                let next = unsafe { base.at::<Page>(head) }.next();
                header.classes[index].store(next, Ordering::Relaxed);
                head
            } else {
                header.stack.allocate(0, class.value() as u64, BLOCK_ALIGNMENT)?
            }
        };

        //  Safety:
        //  -   `page_offset` designates a block of `class` bytes, exclusively owned.
        let page = unsafe { base.at::<Page>(page_offset) };
        page.init(class.value() as u64, payload, Page::ALLOCATED);

        Ok(page_offset + PAGE_SIZE)
    }

    fn free_block(base: &AllocatorBase, payload: u64) -> Result<()> {
        let page_offset = payload - PAGE_SIZE;

        //  Safety:
        //  -   `payload` was validated by `AllocatorBase::page`.
        let page = unsafe { base.at::<Page>(page_offset) };

        let (index, class) = Self::class_of(page.size() - PAGE_SIZE)
            .ok_or(Error::InvalidPointer(OffsetPointer::new(payload)))?;

        if class.value() as u64 != page.size() {
            return Err(Error::InvalidPointer(OffsetPointer::new(payload)));
        }

        let header = Self::header(base);
        let _guard = header.lock.lock(base.thread_model());

        page.set_next(header.classes[index].load(Ordering::Relaxed));
        header.classes[index].store(page_offset, Ordering::Relaxed);

        Ok(())
    }
}

#[cfg(test)]
mod tests {

use std::sync::Arc;

use crate::{AllocatorId, ArrayRegion, Backend, BackendId, BackendKind, NoOpThreadModel};

use super::*;

fn scalable(size: usize) -> AllocatorBase {
    let region = Box::new(ArrayRegion::with_capacity(size).unwrap());
    let backend = Arc::new(Backend::shm_init(BackendId::new(1), BackendKind::Local, region).unwrap());

    let base = AllocatorBase::format::<ScalableHeader>(backend, Arc::new(NoOpThreadModel), 3,
        AllocatorId::new(1, 0), 0).unwrap();
    Scalable::init(&base);
    base.publish();
    base
}

#[test]
fn scalable_class_of() {
    fn class(payload: u64) -> Option<(usize, usize)> {
        Scalable::class_of(payload).map(|(index, class)| (index, class.value()))
    }

    assert_eq!(Some((0, 64)), class(0));
    assert_eq!(Some((0, 64)), class(32));
    assert_eq!(Some((1, 128)), class(33));
    assert_eq!(Some((1, 128)), class(96));
    assert_eq!(Some((2, 256)), class(97));
    assert_eq!(None, class(u64::MAX));
}

#[test]
fn scalable_reuses_class() {
    let base = scalable(1 << 16);

    let first = Scalable::allocate(&base, 40).unwrap();
    Scalable::free(&base, first).unwrap();

    //  Same class, albeit a different size.
    let second = Scalable::allocate(&base, 90).unwrap();
    assert_eq!(first, second);
    assert_eq!(90, base.allocated());
}

#[test]
fn scalable_lists_are_lifo() {
    let base = scalable(1 << 16);

    let first = Scalable::allocate(&base, 10).unwrap();
    let second = Scalable::allocate(&base, 10).unwrap();

    Scalable::free(&base, first).unwrap();
    Scalable::free(&base, second).unwrap();

    assert_eq!(second, Scalable::allocate(&base, 10).unwrap());
    assert_eq!(first, Scalable::allocate(&base, 10).unwrap());
}

#[test]
fn scalable_double_free() {
    let base = scalable(1 << 16);

    let pointer = Scalable::allocate(&base, 10).unwrap();
    Scalable::free(&base, pointer).unwrap();

    assert!(matches!(Scalable::free(&base, pointer), Err(Error::DoubleFree(_))));
}

#[test]
fn scalable_aligned() {
    let base = scalable(1 << 16);
    let alignment = PowerOf2::new(512).unwrap();

    let pointer = Scalable::aligned_allocate(&base, 100, alignment).unwrap();
    assert!(alignment.is_aligned(pointer.value() as usize));
    assert_eq!(100, base.allocated());

    Scalable::free(&base, pointer).unwrap();
    assert_eq!(0, base.allocated());

    assert!(matches!(Scalable::free(&base, pointer), Err(Error::DoubleFree(_))));
}

#[test]
fn scalable_reallocate_in_place() {
    let base = scalable(1 << 16);

    let pointer = Scalable::allocate(&base, 40).unwrap();
    let same = Scalable::reallocate(&base, pointer, 96).unwrap();

    assert_eq!(pointer, same);
    assert_eq!(96, base.allocated());

    //  Safety:
    //  -   The block holds 96 bytes.
    unsafe { *(base.pointer(same.value()) as *mut u64) = 42 };

    let moved = Scalable::reallocate(&base, same, 1000).unwrap();

    assert_ne!(same, moved);
    assert_eq!(1000, base.allocated());
    //  Safety:
    //  -   The block holds 1000 bytes.
    assert_eq!(42, unsafe { *(base.pointer(moved.value()) as *const u64) });
}

#[test]
fn scalable_huge_request() {
    let base = scalable(1 << 16);
    let page = PowerOf2::new(4096).unwrap();

    for size in [usize::MAX, usize::MAX - 100, usize::MAX / 2] {
        let result = Scalable::allocate(&base, size);
        assert!(matches!(result, Err(Error::OutOfMemory { .. })), "{:?}", result);

        let result = Scalable::aligned_allocate(&base, size, page);
        assert!(matches!(result, Err(Error::OutOfMemory { .. })), "{:?}", result);
    }

    let pointer = Scalable::allocate(&base, 16).unwrap();

    assert!(matches!(Scalable::reallocate(&base, pointer, usize::MAX), Err(Error::OutOfMemory { .. })));
    assert_eq!(16, base.allocated());

    Scalable::free(&base, pointer).unwrap();
    assert_eq!(0, base.allocated());
}

}
