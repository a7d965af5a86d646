//! Abstraction over the providers of memory regions.
//!
//! A `Platform` produces the raw regions over which backends are formatted, or re-opens the regions formatted by
//! another participant from their locator.

use std::{
    alloc::{self, Layout},
    ptr::NonNull,
    sync::Arc,
};

use super::{BackendKind, DeviceRuntime, Error, NoDevices, NoOpThreadModel, Result, ThreadModel};

/// Region
///
/// A contiguous range of addressable memory, mapped for as long as the instance lives.
pub trait Region: Send + Sync {
    /// Returns the base address of the region.
    fn as_ptr(&self) -> NonNull<u8>;

    /// Returns the size of the region, in bytes.
    fn len(&self) -> usize;

    /// Returns whether the region is empty.
    fn is_empty(&self) -> bool { self.len() == 0 }

    /// Returns the locator through which other participants may open the region, if any.
    fn locator(&self) -> Option<String> { None }

    /// Releases the resource backing the region, such as a shared memory segment name.
    ///
    /// The mapping itself is released on drop.
    fn destroy(&self) -> Result<()> { Ok(()) }
}

/// ArrayRegion
///
/// A region over process memory, either allocated by the region or provided by the caller.
pub struct ArrayRegion {
    ptr: NonNull<u8>,
    len: usize,
    owned: bool,
}

impl ArrayRegion {
    //  Alignment of allocated regions, suitable for any header.
    const ALIGNMENT: usize = 4096;

    /// Allocates a zeroed region of `len` bytes, released on drop.
    pub fn with_capacity(len: usize) -> Result<Self> {
        let layout = Self::layout(len)?;

        //  Safety:
        //  -   `layout` has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(Error::OutOfMemory { requested: len, available: 0 })?;

        Ok(Self { ptr, len, owned: true })
    }

    /// Creates a region over caller-provided memory.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `[ptr, ptr + len)` is valid for reads and writes for the lifetime of the instance.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self { Self { ptr, len, owned: false } }

    fn layout(len: usize) -> Result<Layout> {
        Layout::from_size_align(len.max(1), Self::ALIGNMENT)
            .map_err(|_| Error::RegionTooSmall { size: len, minimum: 1 })
    }
}

impl Region for ArrayRegion {
    fn as_ptr(&self) -> NonNull<u8> { self.ptr }

    fn len(&self) -> usize { self.len }
}

impl Drop for ArrayRegion {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }

        if let Ok(layout) = Self::layout(self.len) {
            //  Safety:
            //  -   `self.ptr` was allocated with this very layout in `with_capacity`.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

//  Safety:
//  -   Concurrent accesses to the content are synchronized by the structures formatted within.
unsafe impl Send for ArrayRegion {}
unsafe impl Sync for ArrayRegion {}

/// Platform
///
/// Abstraction over the services of the OS, or of the device, hosting a MemoryManager.
pub trait Platform: Send + Sync {
    /// Creates a fresh region of `size` bytes for a backend of the given kind.
    ///
    /// The locator names the region, for kinds which require one.
    fn create_region(&self, kind: BackendKind, size: usize, locator: Option<&str>) -> Result<Box<dyn Region>>;

    /// Opens the existing region designated by `locator`.
    fn open_region(&self, kind: BackendKind, locator: &str) -> Result<Box<dyn Region>>;

    /// Returns the device runtime.
    fn devices(&self) -> &dyn DeviceRuntime;

    /// Returns the thread model.
    fn thread_model(&self) -> Arc<dyn ThreadModel>;
}

/// DevicePlatform
///
/// The platform of a device context, which only offers private regions.
#[derive(Clone, Copy, Debug, Default)]
pub struct DevicePlatform;

impl Platform for DevicePlatform {
    fn create_region(&self, kind: BackendKind, size: usize, _: Option<&str>) -> Result<Box<dyn Region>> {
        match kind {
            BackendKind::Local => Ok(Box::new(ArrayRegion::with_capacity(size)?)),
            _ => Err(Error::UnsupportedBackend(kind)),
        }
    }

    fn open_region(&self, kind: BackendKind, _: &str) -> Result<Box<dyn Region>> {
        Err(Error::UnsupportedBackend(kind))
    }

    fn devices(&self) -> &dyn DeviceRuntime { &NoDevices }

    fn thread_model(&self) -> Arc<dyn ThreadModel> { Arc::new(NoOpThreadModel) }
}
