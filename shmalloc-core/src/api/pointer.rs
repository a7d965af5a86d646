//! The pointer model.
//!
//! Allocations are identified by an offset relative to the base of their backend, which is meaningful in every
//! address space which attached the backend, whatever the address at which the backend was mapped.
//!
//! -   `OffsetPointer`: offset within the backend of the allocator.
//! -   `Pointer`: the portable pointer, pairing the OffsetPointer with the AllocatorId.
//! -   `FullPtr`: a portable pointer paired with the address it resolves to in the current address space.

use core::{fmt, ptr};

use super::{Allocator, AllocatorId, Configuration, MemoryManager};

/// OffsetPointer
///
/// Offset relative to the base of a backend; `u64::MAX` is the null offset.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Eq, Ord, Hash)]
#[repr(transparent)]
pub struct OffsetPointer(u64);

impl OffsetPointer {
    /// The null offset.
    pub const NULL: OffsetPointer = OffsetPointer(u64::MAX);

    /// Creates an OffsetPointer.
    pub const fn new(offset: u64) -> Self { Self(offset) }

    /// Creates a null OffsetPointer.
    pub const fn null() -> Self { Self::NULL }

    /// Returns whether the offset is null.
    pub const fn is_null(&self) -> bool { self.0 == u64::MAX }

    /// Retrieves the offset.
    pub const fn value(&self) -> u64 { self.0 }

    /// Returns an offset `count` bytes further.
    pub const fn byte_add(&self, count: u64) -> Self { Self(self.0 + count) }

    /// Returns an offset `count` bytes closer to the base.
    pub const fn byte_sub(&self, count: u64) -> Self { Self(self.0 - count) }
}

impl Default for OffsetPointer {
    fn default() -> Self { Self::NULL }
}

impl fmt::Display for OffsetPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() { write!(f, "null") } else { write!(f, "{:#x}", self.0) }
    }
}

/// Pointer
///
/// The portable pointer: the relocatable identity of an allocation, safe to persist or transmit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct Pointer {
    alloc_id: AllocatorId,
    off: OffsetPointer,
}

impl Pointer {
    /// Creates a Pointer.
    pub const fn new(alloc_id: AllocatorId, off: OffsetPointer) -> Self { Self { alloc_id, off } }

    /// Creates a null Pointer.
    pub const fn null() -> Self { Self::new(AllocatorId::NULL, OffsetPointer::NULL) }

    /// Returns whether the pointer is null.
    pub const fn is_null(&self) -> bool { self.off.is_null() }

    /// Returns the identifier of the owning allocator.
    pub const fn alloc_id(&self) -> AllocatorId { self.alloc_id }

    /// Returns the offset within the backend of the owning allocator.
    pub const fn offset(&self) -> OffsetPointer { self.off }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}@{}", self.off, self.alloc_id) }
}

/// FullPtr
///
/// A portable pointer along with the address it resolves to in the current address space.
///
/// The address is only meaningful within the current process, or device; only the `Pointer` part may be sent
/// elsewhere.
pub struct FullPtr<T> {
    ptr: *mut T,
    shm: Pointer,
}

impl<T> FullPtr<T> {
    /// Creates a null FullPtr.
    pub const fn null() -> Self { Self { ptr: ptr::null_mut(), shm: Pointer::null() } }

    /// Resolves a portable pointer through the manager.
    ///
    /// The result is null if the allocator is not registered.
    pub fn new<C: Configuration>(manager: &MemoryManager<C>, shm: Pointer) -> Self {
        match manager.convert(&shm) {
            Some(ptr) => Self { ptr: ptr as *mut T, shm },
            None => Self::null(),
        }
    }

    /// Derives the portable pointer of a local address through the manager.
    ///
    /// The result is null if no registered allocator contains the address.
    pub fn from_raw<C: Configuration>(manager: &MemoryManager<C>, raw: *mut T) -> Self {
        match manager.convert_raw(raw as *const u8) {
            Some(shm) => Self { ptr: raw, shm },
            None => Self::null(),
        }
    }

    /// Resolves an offset of a known allocator.
    pub fn from_allocator(allocator: &Allocator, off: OffsetPointer) -> Self {
        if off.is_null() {
            return Self::null();
        }

        let ptr = allocator.convert_offset(off) as *mut T;

        Self { ptr, shm: Pointer::new(allocator.id(), off) }
    }

    /// Returns the local address.
    pub fn as_ptr(&self) -> *mut T { self.ptr }

    /// Returns the portable pointer.
    pub fn shm(&self) -> Pointer { self.shm }

    /// Returns whether the pointer is null.
    pub fn is_null(&self) -> bool { self.ptr.is_null() }

    /// Reinterprets the pointee.
    pub fn cast<U>(self) -> FullPtr<U> { FullPtr { ptr: self.ptr as *mut U, shm: self.shm } }
}

impl<T> Clone for FullPtr<T> {
    fn clone(&self) -> Self { *self }
}

impl<T> Copy for FullPtr<T> {}

impl<T> fmt::Debug for FullPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FullPtr").field("ptr", &self.ptr).field("shm", &self.shm).finish()
    }
}

impl<T> PartialEq for FullPtr<T> {
    fn eq(&self, other: &Self) -> bool { self.ptr == other.ptr && self.shm == other.shm }
}

impl<T> Eq for FullPtr<T> {}
