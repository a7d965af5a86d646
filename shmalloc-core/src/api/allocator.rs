//! Allocators, formatted within backends.
//!
//! An allocator is created once, by any participant, at the start of the usable region of a backend. Every other
//! participant attaching the backend discovers it from its header, whatever the address at which the backend is
//! mapped in their address space.

use core::{fmt, ptr::NonNull};
use std::sync::Arc;

use crate::{
    internals::{
        fixed_page::{FixedPage, FixedPageHeader},
        header::{AllocatorBase, BLOCK_ALIGNMENT},
        malloc::Malloc,
        scalable::{Scalable, ScalableHeader},
        stack::{Stack, StackHeader},
    },
    PowerOf2,
};

use super::{AllocatorId, Backend, BackendId, Error, FullPtr, OffsetPointer, Result, ThreadModel};

/// AllocatorKind
///
/// The closed set of allocation policies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocatorKind {
    /// Monotonic bump allocation; freed blocks are never reused.
    Stack,
    /// Free lists of exactly sized blocks, discovered as blocks are freed.
    FixedPage,
    /// Power-of-2 size classes.
    Scalable,
    /// Pass-through to the system heap; offsets are process-local addresses.
    Malloc,
}

impl AllocatorKind {
    fn tag(&self) -> u32 {
        match self {
            AllocatorKind::Stack => 1,
            AllocatorKind::FixedPage => 2,
            AllocatorKind::Scalable => 3,
            AllocatorKind::Malloc => 4,
        }
    }

    fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(AllocatorKind::Stack),
            2 => Some(AllocatorKind::FixedPage),
            3 => Some(AllocatorKind::Scalable),
            4 => Some(AllocatorKind::Malloc),
            _ => None,
        }
    }
}

impl fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(self, f) }
}

/// Allocator
///
/// A view over an allocator formatted within a backend.
pub struct Allocator {
    base: AllocatorBase,
    variant: Variant,
}

enum Variant {
    Stack,
    FixedPage,
    Scalable,
    Malloc(Malloc),
}

impl Allocator {
    /// Formats a fresh allocator of the given kind at the start of the usable region of `backend`.
    ///
    /// The custom header, of `custom_header_size` bytes, is zeroed.
    pub fn shm_init(
        kind: AllocatorKind,
        id: AllocatorId,
        custom_header_size: usize,
        backend: Arc<Backend>,
        thread_model: Arc<dyn ThreadModel>,
    )
        -> Result<Allocator>
    {
        let tag = kind.tag();

        let allocator = match kind {
            AllocatorKind::Stack => {
                let base = AllocatorBase::format::<StackHeader>(backend, thread_model, tag, id, custom_header_size)?;
                Stack::init(&base);
                Allocator { base, variant: Variant::Stack }
            },
            AllocatorKind::FixedPage => {
                let base =
                    AllocatorBase::format::<FixedPageHeader>(backend, thread_model, tag, id, custom_header_size)?;
                FixedPage::init(&base);
                Allocator { base, variant: Variant::FixedPage }
            },
            AllocatorKind::Scalable => {
                let base =
                    AllocatorBase::format::<ScalableHeader>(backend, thread_model, tag, id, custom_header_size)?;
                Scalable::init(&base);
                Allocator { base, variant: Variant::Scalable }
            },
            AllocatorKind::Malloc => {
                let base = AllocatorBase::format::<()>(backend, thread_model, tag, id, custom_header_size)?;
                Allocator { base, variant: Variant::Malloc(Malloc::default()) }
            },
        };

        allocator.base.publish();

        Ok(allocator)
    }

    /// Attaches to the allocator formatted within `backend`, if any.
    pub fn shm_deserialize(backend: Arc<Backend>, thread_model: Arc<dyn ThreadModel>) -> Option<Allocator> {
        let base = AllocatorBase::attach(backend, thread_model)?;

        let variant = match AllocatorKind::from_tag(base.kind())? {
            AllocatorKind::Stack => Variant::Stack,
            AllocatorKind::FixedPage => Variant::FixedPage,
            AllocatorKind::Scalable => Variant::Scalable,
            AllocatorKind::Malloc => Variant::Malloc(Malloc::default()),
        };

        Some(Allocator { base, variant })
    }

    /// Returns the identifier.
    pub fn id(&self) -> AllocatorId { self.base.id() }

    /// Returns the identifier of the backend holding the allocator.
    pub fn backend_id(&self) -> BackendId { self.base.backend_id() }

    /// Returns the backend holding the allocator.
    pub fn backend(&self) -> &Arc<Backend> { self.base.backend() }

    /// Returns the kind.
    pub fn kind(&self) -> AllocatorKind {
        match self.variant {
            Variant::Stack => AllocatorKind::Stack,
            Variant::FixedPage => AllocatorKind::FixedPage,
            Variant::Scalable => AllocatorKind::Scalable,
            Variant::Malloc(_) => AllocatorKind::Malloc,
        }
    }

    /// Allocates a block of `size` bytes.
    pub fn allocate_offset(&self, size: usize) -> Result<OffsetPointer> {
        match &self.variant {
            Variant::Stack => Stack::allocate(&self.base, size, BLOCK_ALIGNMENT),
            Variant::FixedPage => FixedPage::allocate(&self.base, size),
            Variant::Scalable => Scalable::allocate(&self.base, size),
            Variant::Malloc(malloc) => malloc.allocate(&self.base, size, BLOCK_ALIGNMENT),
        }
    }

    /// Allocates a block of `size` bytes, whose offset is a multiple of `alignment`.
    ///
    /// Backends are mapped at page boundaries, hence the address is aligned as well for alignments up to the page
    /// size.
    pub fn aligned_allocate_offset(&self, size: usize, alignment: PowerOf2) -> Result<OffsetPointer> {
        match &self.variant {
            Variant::Stack => Stack::allocate(&self.base, size, alignment),
            Variant::FixedPage => Err(self.not_supported("aligned allocation")),
            Variant::Scalable => Scalable::aligned_allocate(&self.base, size, alignment),
            Variant::Malloc(malloc) => malloc.allocate(&self.base, size, alignment),
        }
    }

    /// Resizes the block at `pointer`, which may move; the content is preserved up to the smaller size.
    pub fn reallocate_offset_no_null_check(&self, pointer: OffsetPointer, size: usize) -> Result<OffsetPointer> {
        match &self.variant {
            Variant::Stack => Stack::reallocate(&self.base, pointer, size),
            Variant::FixedPage => Err(self.not_supported("reallocation")),
            Variant::Scalable => Scalable::reallocate(&self.base, pointer, size),
            Variant::Malloc(malloc) => malloc.reallocate(&self.base, pointer, size),
        }
    }

    /// Resizes the block at `pointer`, or allocates a fresh one if `pointer` is null.
    pub fn reallocate_offset(&self, pointer: OffsetPointer, size: usize) -> Result<OffsetPointer> {
        if pointer.is_null() {
            return self.allocate_offset(size);
        }

        self.reallocate_offset_no_null_check(pointer, size)
    }

    /// Frees the block at `pointer`.
    pub fn free_offset_no_null_check(&self, pointer: OffsetPointer) -> Result<()> {
        match &self.variant {
            Variant::Stack => Stack::free(&self.base, pointer),
            Variant::FixedPage => FixedPage::free(&self.base, pointer),
            Variant::Scalable => Scalable::free(&self.base, pointer),
            Variant::Malloc(malloc) => malloc.free(&self.base, pointer),
        }
    }

    /// Frees the block at `pointer`, if not null.
    pub fn free_offset(&self, pointer: OffsetPointer) -> Result<()> {
        if pointer.is_null() {
            return Ok(());
        }

        self.free_offset_no_null_check(pointer)
    }

    /// Returns the number of bytes currently allocated, as requested by the users.
    ///
    /// The counter lives in the backend, and thus accounts for all participants.
    pub fn currently_allocated_size(&self) -> usize { self.base.allocated() }

    /// Returns the size of the custom header.
    pub fn custom_header_size(&self) -> usize { self.base.custom_header_size() }

    /// Returns a pointer to the custom header, or None if it is too small to hold a `T`.
    pub fn custom_header<T>(&self) -> Option<NonNull<T>> { self.base.custom_header() }

    /// Returns the address of `pointer` in the current address space; null if `pointer` is null.
    pub fn convert_offset(&self, pointer: OffsetPointer) -> *mut u8 {
        if pointer.is_null() {
            return core::ptr::null_mut();
        }

        match self.variant {
            Variant::Malloc(_) => pointer.value() as *mut u8,
            _ => self.base.pointer(pointer.value()),
        }
    }

    /// Returns the offset of an address of the current address space, if it belongs to this allocator.
    pub fn convert_ptr(&self, pointer: *const u8) -> Option<OffsetPointer> {
        if !self.contains_ptr(pointer) {
            return None;
        }

        match self.variant {
            Variant::Malloc(_) => Some(OffsetPointer::new(pointer as u64)),
            _ => Some(OffsetPointer::new(pointer as u64 - self.backend().base().as_ptr() as u64)),
        }
    }

    /// Returns whether an address of the current address space belongs to this allocator.
    ///
    /// For the Malloc allocator, only the addresses of live blocks do.
    pub fn contains_ptr(&self, pointer: *const u8) -> bool {
        match &self.variant {
            Variant::Malloc(malloc) => malloc.contains(pointer),
            _ => self.backend().contains(pointer),
        }
    }

    /// Allocates a block of `size` bytes, and resolves it.
    pub fn allocate_ptr<T>(&self, size: usize) -> Result<FullPtr<T>> {
        let pointer = self.allocate_offset(size)?;

        Ok(self.full_ptr(pointer))
    }

    /// Resolves an offset of this allocator.
    pub fn full_ptr<T>(&self, pointer: OffsetPointer) -> FullPtr<T> { FullPtr::from_allocator(self, pointer) }

    fn not_supported(&self, operation: &'static str) -> Error {
        Error::NotSupported { operation, allocator: self.kind() }
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("backend_id", &self.backend_id())
            .finish()
    }
}
