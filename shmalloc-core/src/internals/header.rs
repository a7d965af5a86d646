//! Header common to all allocators, and the view over it.
//!
//! Layout of a backend holding an allocator, offsets relative to the base of the backend:
//!
//! -   `[0, 64)`: backend header.
//! -   `[64, 128)`: allocator header.
//! -   `[128, custom_header_offset)`: header of the allocator variant.
//! -   `[custom_header_offset, region_offset)`: custom header, of caller-specified size.
//! -   `[region_offset, backend size)`: allocatable region.

use core::{
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicU64, Ordering},
};
use std::sync::Arc;

use crate::{
    api::BACKEND_HEADER_SIZE, AllocatorId, Backend, BackendId, Error, OffsetPointer, PowerOf2, Result, ThreadModel,
};

use super::page::{Page, PAGE_SIZE};

const ALLOCATOR_MAGIC: u64 = u64::from_le_bytes(*b"SHMALLOC");

const HEADER_OFFSET: u64 = BACKEND_HEADER_SIZE as u64;

const VARIANT_OFFSET: u64 = HEADER_OFFSET + mem::size_of::<AllocatorHeader>() as u64;

//  Alignment of the custom header and of the allocatable region.
//  Safety:
//  -   64 is a power of 2.
const LINE: PowerOf2 = unsafe { PowerOf2::new_unchecked(64) };

//  Alignment of blocks.
pub(crate) const BLOCK_ALIGNMENT: PowerOf2 = PowerOf2::align_of::<Page>();

#[repr(C)]
pub(crate) struct AllocatorHeader {
    magic: AtomicU64,
    kind: u32,
    backend_id: u32,
    id: AllocatorId,
    custom_header_size: u64,
    custom_header_offset: u64,
    region_offset: u64,
    region_size: u64,
    total_alloc: AtomicU64,
}

const _: () = assert!(mem::size_of::<AllocatorHeader>() == 64);

//  View over the common part of an allocator.
pub(crate) struct AllocatorBase {
    backend: Arc<Backend>,
    thread_model: Arc<dyn ThreadModel>,
}

impl AllocatorBase {
    //  Formats the header of an allocator, reserving room for a variant header of type `V`.
    //
    //  The allocator is only discoverable after `publish`.
    pub(crate) fn format<V>(
        backend: Arc<Backend>,
        thread_model: Arc<dyn ThreadModel>,
        kind: u32,
        id: AllocatorId,
        custom_header_size: usize,
    )
        -> Result<AllocatorBase>
    {
        let size = backend.size() as u64;

        let custom_header_offset = LINE.round_up_offset(VARIANT_OFFSET + mem::size_of::<V>() as u64);
        let region_offset = (custom_header_offset as usize).checked_add(custom_header_size)
            .and_then(|end| LINE.checked_round_up(end))
            .map(|end| end as u64)
            .unwrap_or(u64::MAX);

        if region_offset > size {
            let minimum = usize::try_from(region_offset).unwrap_or(usize::MAX);
            return Err(Error::RegionTooSmall { size: size as usize, minimum });
        }

        let header = AllocatorHeader {
            magic: AtomicU64::new(0),
            kind,
            backend_id: backend.id().value(),
            id,
            custom_header_size: custom_header_size as u64,
            custom_header_offset,
            region_offset,
            region_size: size - region_offset,
            total_alloc: AtomicU64::new(0),
        };

        let base = AllocatorBase { backend, thread_model };

        //  Safety:
        //  -   The backend is large enough to hold the header, as `region_offset <= size`.
        //  -   The header is suitably aligned, backends being page-aligned.
        unsafe {
            base.header().magic.store(0, Ordering::Release);
            ptr::write(base.pointer(HEADER_OFFSET) as *mut AllocatorHeader, header);
            ptr::write_bytes(base.pointer(custom_header_offset), 0, custom_header_size);
        }

        Ok(base)
    }

    //  Makes the allocator discoverable, once the variant header is initialized.
    pub(crate) fn publish(&self) { self.header().magic.store(ALLOCATOR_MAGIC, Ordering::Release) }

    //  Attaches to the allocator formatted within `backend`.
    pub(crate) fn attach(backend: Arc<Backend>, thread_model: Arc<dyn ThreadModel>) -> Option<AllocatorBase> {
        if backend.size() < VARIANT_OFFSET as usize {
            return None;
        }

        let base = AllocatorBase { backend, thread_model };
        let header = base.header();

        if header.magic.load(Ordering::Acquire) != ALLOCATOR_MAGIC {
            return None;
        }

        if header.region_offset + header.region_size > base.backend.size() as u64 {
            return None;
        }

        Some(base)
    }

    pub(crate) fn backend(&self) -> &Arc<Backend> { &self.backend }

    pub(crate) fn thread_model(&self) -> &dyn ThreadModel { &*self.thread_model }

    pub(crate) fn id(&self) -> AllocatorId { self.header().id }

    pub(crate) fn backend_id(&self) -> BackendId { BackendId::new(self.header().backend_id) }

    pub(crate) fn kind(&self) -> u32 { self.header().kind }

    pub(crate) fn custom_header_size(&self) -> usize { self.header().custom_header_size as usize }

    pub(crate) fn custom_header_offset(&self) -> u64 { self.header().custom_header_offset }

    pub(crate) fn region_offset(&self) -> u64 { self.header().region_offset }

    pub(crate) fn region_end(&self) -> u64 { self.header().region_offset + self.header().region_size }

    pub(crate) fn allocated(&self) -> usize { self.header().total_alloc.load(Ordering::Acquire) as usize }

    pub(crate) fn add_allocated(&self, size: u64) { self.header().total_alloc.fetch_add(size, Ordering::AcqRel); }

    pub(crate) fn sub_allocated(&self, size: u64) { self.header().total_alloc.fetch_sub(size, Ordering::AcqRel); }

    //  Returns the address of `offset` in the current address space.
    pub(crate) fn pointer(&self, offset: u64) -> *mut u8 {
        self.backend.base().as_ptr().wrapping_add(offset as usize)
    }

    //  Returns the variant header.
    //
    //  #   Safety
    //
    //  -   Assumes that the allocator was formatted with `V` as variant.
    pub(crate) unsafe fn variant<V>(&self) -> &V { self.at(VARIANT_OFFSET) }

    //  Returns a reference to the `T` at `offset`.
    //
    //  #   Safety
    //
    //  -   Assumes that `offset` designates a suitably aligned `T` within the backend.
    pub(crate) unsafe fn at<T>(&self, offset: u64) -> &T { &*(self.pointer(offset) as *const T) }

    //  Returns the header of the block whose payload is at `payload`.
    pub(crate) fn page(&self, payload: OffsetPointer) -> Result<&Page> {
        let offset = payload.value();

        let valid = !payload.is_null()
            && offset >= self.region_offset() + PAGE_SIZE
            && offset < self.region_end()
            && BLOCK_ALIGNMENT.is_aligned(offset as usize);

        if !valid {
            return Err(Error::InvalidPointer(payload));
        }

        //  Safety:
        //  -   The page lies within the allocatable region, and is suitably aligned.
        Ok(unsafe { self.at(offset - PAGE_SIZE) })
    }

    //  Copies `len` bytes from the payload at `from` to the payload at `to`.
    //
    //  #   Safety
    //
    //  -   Assumes that both payloads are at least `len` bytes, and distinct.
    pub(crate) unsafe fn copy(&self, from: u64, to: u64, len: u64) {
        ptr::copy_nonoverlapping(self.pointer(from), self.pointer(to), len as usize);
    }

    pub(crate) fn custom_header<T>(&self) -> Option<NonNull<T>> {
        if mem::size_of::<T>() > self.custom_header_size() {
            return None;
        }

        NonNull::new(self.pointer(self.custom_header_offset()) as *mut T)
    }

    fn header(&self) -> &AllocatorHeader {
        //  Safety:
        //  -   The backend is large enough to hold the header, as checked on construction.
        unsafe { self.at(HEADER_OFFSET) }
    }
}
