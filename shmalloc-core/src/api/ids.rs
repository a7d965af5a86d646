//! Identifiers of backends and allocators.

use core::fmt;

/// BackendId
///
/// Index of a backend in the backend table of a MemoryManager.
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd, Eq, Ord, Hash)]
#[repr(transparent)]
pub struct BackendId(u32);

impl BackendId {
    /// The root backend, bootstrapped by every MemoryManager.
    pub const ROOT: BackendId = BackendId(0);

    /// Creates a BackendId.
    pub const fn new(value: u32) -> Self { Self(value) }

    /// Retrieves the value.
    pub const fn value(&self) -> u32 { self.0 }

    /// Returns whether this is the root backend.
    pub const fn is_root(&self) -> bool { self.0 == 0 }

    /// Returns the slot of this backend in a backend table.
    pub const fn index(&self) -> usize { self.0 as usize }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "backend#{}", self.0) }
}

/// AllocatorId
///
/// Composite identifier of an allocator: `(major, minor)`.
///
/// `(0, 0)` is reserved for the root allocator, and `(u32::MAX, u32::MAX)` is the null identifier. Neither may be
/// used for a user allocator.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Eq, Ord, Hash)]
#[repr(C)]
pub struct AllocatorId {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
}

impl AllocatorId {
    /// The root allocator.
    pub const ROOT: AllocatorId = AllocatorId::new(0, 0);

    /// The null allocator.
    pub const NULL: AllocatorId = AllocatorId::new(u32::MAX, u32::MAX);

    /// Creates an AllocatorId.
    pub const fn new(major: u32, minor: u32) -> Self { Self { major, minor } }

    /// Returns whether this is the null identifier.
    pub const fn is_null(&self) -> bool { self.major == u32::MAX && self.minor == u32::MAX }

    /// Returns whether this is the root identifier.
    pub const fn is_root(&self) -> bool { self.major == 0 && self.minor == 0 }

    /// Returns the slot of this allocator in an allocator table with `minors_per_major` minors per major.
    ///
    /// Returns None if the computation overflows, or if `minor` exceeds `minors_per_major`.
    pub fn index(&self, minors_per_major: usize) -> Option<usize> {
        let minor = self.minor as usize;

        if minor >= minors_per_major {
            return None;
        }

        (self.major as usize).checked_mul(minors_per_major)?.checked_add(minor)
    }
}

impl Default for AllocatorId {
    fn default() -> Self { Self::NULL }
}

impl fmt::Display for AllocatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}.{}", self.major, self.minor) }
}
