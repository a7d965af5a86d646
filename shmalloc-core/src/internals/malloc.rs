//! Pass-through to the system heap.
//!
//! Offsets are the addresses of the blocks, hence meaningless in any other address space; the live blocks are
//! tracked per view, to detect double frees and convert addresses back.

use std::{
    alloc::{self, Layout},
    collections::HashMap,
};

use parking_lot::Mutex;

use crate::{Error, OffsetPointer, PowerOf2, Result};

use super::header::{AllocatorBase, BLOCK_ALIGNMENT};

#[derive(Default)]
pub(crate) struct Malloc {
    live: Mutex<HashMap<u64, (Layout, usize)>>,
}

impl Malloc {
    pub(crate) fn allocate(&self, base: &AllocatorBase, size: usize, alignment: PowerOf2) -> Result<OffsetPointer> {
        let layout = Self::layout(size, alignment)?;

        //  Safety:
        //  -   `layout` has a non-zero size.
        let pointer = unsafe { alloc::alloc(layout) };

        if pointer.is_null() {
            return Err(Error::OutOfMemory { requested: size, available: 0 });
        }

        self.live.lock().insert(pointer as u64, (layout, size));
        base.add_allocated(size as u64);

        Ok(OffsetPointer::new(pointer as u64))
    }

    pub(crate) fn reallocate(&self, base: &AllocatorBase, pointer: OffsetPointer, size: usize)
        -> Result<OffsetPointer>
    {
        let mut live = self.live.lock();

        let (layout, used) = *live.get(&pointer.value()).ok_or(Error::InvalidPointer(pointer))?;

        let new_layout = Self::layout(size, PowerOf2::new(layout.align()).unwrap_or(BLOCK_ALIGNMENT))?;

        //  Safety:
        //  -   `pointer` was allocated with `layout`, as per the live set.
        //  -   The new size, rounded up to the alignment, does not overflow as checked by `Self::layout`.
        let result = unsafe { alloc::realloc(pointer.value() as *mut u8, layout, new_layout.size()) };

        if result.is_null() {
            return Err(Error::OutOfMemory { requested: size, available: 0 });
        }

        live.remove(&pointer.value());
        live.insert(result as u64, (new_layout, size));

        base.add_allocated(size as u64);
        base.sub_allocated(used as u64);

        Ok(OffsetPointer::new(result as u64))
    }

    pub(crate) fn free(&self, base: &AllocatorBase, pointer: OffsetPointer) -> Result<()> {
        let (layout, used) = self.live.lock().remove(&pointer.value()).ok_or(Error::DoubleFree(pointer))?;

        //  Safety:
        //  -   `pointer` was allocated with `layout`, as per the live set.
        unsafe { alloc::dealloc(pointer.value() as *mut u8, layout) };

        base.sub_allocated(used as u64);

        Ok(())
    }

    pub(crate) fn contains(&self, pointer: *const u8) -> bool { self.live.lock().contains_key(&(pointer as u64)) }

    fn layout(size: usize, alignment: PowerOf2) -> Result<Layout> {
        Layout::from_size_align(size.max(1), alignment.value())
            .map_err(|_| Error::OutOfMemory { requested: size, available: 0 })
    }
}

impl Drop for Malloc {
    fn drop(&mut self) {
        for (pointer, (layout, _)) in self.live.get_mut().drain() {
            //  Safety:
            //  -   `pointer` was allocated with `layout`, as per the live set.
            unsafe { alloc::dealloc(pointer as *mut u8, layout) };
        }
    }
}

#[cfg(test)]
mod tests {

use std::sync::Arc;

use crate::{AllocatorId, ArrayRegion, Backend, BackendId, BackendKind, NoOpThreadModel};

use super::*;

fn base() -> AllocatorBase {
    let region = Box::new(ArrayRegion::with_capacity(4096).unwrap());
    let backend = Arc::new(Backend::shm_init(BackendId::new(1), BackendKind::Local, region).unwrap());

    let base = AllocatorBase::format::<()>(backend, Arc::new(NoOpThreadModel), 4, AllocatorId::new(1, 0), 0)
        .unwrap();
    base.publish();
    base
}

#[test]
fn malloc_allocate_free() {
    let base = base();
    let malloc = Malloc::default();

    let pointer = malloc.allocate(&base, 100, BLOCK_ALIGNMENT).unwrap();
    assert!(malloc.contains(pointer.value() as *const u8));
    assert_eq!(100, base.allocated());

    malloc.free(&base, pointer).unwrap();
    assert!(!malloc.contains(pointer.value() as *const u8));
    assert_eq!(0, base.allocated());

    assert!(matches!(malloc.free(&base, pointer), Err(Error::DoubleFree(_))));
}

#[test]
fn malloc_aligned() {
    let base = base();
    let malloc = Malloc::default();
    let alignment = PowerOf2::new(4096).unwrap();

    let pointer = malloc.allocate(&base, 10, alignment).unwrap();

    assert!(alignment.is_aligned(pointer.value() as usize));
}

#[test]
fn malloc_reallocate() {
    let base = base();
    let malloc = Malloc::default();

    let pointer = malloc.allocate(&base, 8, BLOCK_ALIGNMENT).unwrap();
    //  Safety:
    //  -   The block holds 8 bytes.
    unsafe { *(pointer.value() as *mut u64) = 7 };

    let grown = malloc.reallocate(&base, pointer, 4096).unwrap();

    assert_eq!(4096, base.allocated());
    //  Safety:
    //  -   The block holds 4096 bytes.
    assert_eq!(7, unsafe { *(grown.value() as *const u64) });

    assert!(matches!(malloc.reallocate(&base, OffsetPointer::new(8), 16), Err(Error::InvalidPointer(_))));
}

}
