//! Backends: contiguous regions with a self-describing header.
//!
//! The header occupies the first `BACKEND_HEADER_SIZE` bytes of the region, the remainder is available to the
//! allocator later formatted within. Any participant opening the region can reconstruct the backend from the header
//! alone, whatever the address at which it mapped the region.

use core::{
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};

use log::warn;

use crate::utils::is_within;

use super::{BackendId, DeviceId, Error, IpcMemHandle, Region, Result};

/// Size of the header of a backend, in bytes.
pub(crate) const BACKEND_HEADER_SIZE: usize = 64;

const BACKEND_MAGIC: u64 = u64::from_le_bytes(*b"SHMBKEND");

/// BackendKind
///
/// How the region of a backend is obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Process-private memory.
    Local,
    /// POSIX shared memory segment, located by name.
    PosixShm,
    /// Memory-mapped file, located by path.
    MappedFile,
    /// Device memory, located by IPC handle.
    Device(DeviceId),
    /// Host memory, explicitly mirrored to a copy in device memory.
    DeviceMirror(DeviceId),
}

impl BackendKind {
    /// Returns the device associated to the kind, if any.
    pub fn device(&self) -> Option<DeviceId> {
        match *self {
            BackendKind::Device(device) | BackendKind::DeviceMirror(device) => Some(device),
            _ => None,
        }
    }

    fn tag(&self) -> u32 {
        match self {
            BackendKind::Local => 1,
            BackendKind::PosixShm => 2,
            BackendKind::MappedFile => 3,
            BackendKind::Device(_) => 4,
            BackendKind::DeviceMirror(_) => 5,
        }
    }

    fn from_raw(tag: u32, device: u32) -> Option<Self> {
        let device = DeviceId::new(device);

        match tag {
            1 => Some(BackendKind::Local),
            2 => Some(BackendKind::PosixShm),
            3 => Some(BackendKind::MappedFile),
            4 => Some(BackendKind::Device(device)),
            5 => Some(BackendKind::DeviceMirror(device)),
            _ => None,
        }
    }
}

/// Mirror
///
/// The device-resident copy of a mirrored backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mirror {
    /// Handle through which the copy may be opened.
    pub handle: IpcMemHandle,
    /// Size of the copy, in bytes.
    pub size: usize,
}

/// Backend
///
/// A view over a region formatted with a backend header.
///
/// Ownership and scanning are properties of the view, not of the region: each participant decides whether it is
/// responsible for releasing the region, and scans it once.
pub struct Backend {
    region: Box<dyn Region>,
    mirror: Option<Box<dyn Region>>,
    owned: AtomicBool,
    scanned: AtomicBool,
}

impl Backend {
    /// Formats the header of a fresh region.
    ///
    /// The backend is initially disowned.
    pub fn shm_init(id: BackendId, kind: BackendKind, region: Box<dyn Region>) -> Result<Backend> {
        Self::check_size(region.as_ref())?;

        let header = BackendHeader {
            magic: AtomicU64::new(0),
            id: id.value(),
            kind: kind.tag(),
            device: kind.device().map(|d| d.value()).unwrap_or(0),
            flags: AtomicU32::new(0),
            size: region.len() as u64,
            mirror_device: AtomicU32::new(0),
            _padding: 0,
            mirror_key: AtomicU64::new(0),
            mirror_size: AtomicU64::new(0),
            _reserved: 0,
        };

        let pointer = region.as_ptr().as_ptr() as *mut BackendHeader;

        //  Safety:
        //  -   `pointer` is valid for writes of `BACKEND_HEADER_SIZE` bytes, as checked above.
        //  -   `pointer` is suitably aligned, regions being page-aligned.
        unsafe { ptr::write(pointer, header) };

        let backend = Self::new(region);
        backend.header().magic.store(BACKEND_MAGIC, Ordering::Release);

        Ok(backend)
    }

    /// Reconstructs the view of a region formatted by `shm_init`, without altering it.
    ///
    /// The backend is initially disowned.
    pub fn shm_deserialize(region: Box<dyn Region>) -> Result<Backend> {
        Self::check_size(region.as_ref())?;

        let backend = Self::new(region);
        let header = backend.header();

        if header.magic.load(Ordering::Acquire) != BACKEND_MAGIC {
            return Err(Error::InvalidHeader("no backend header found".to_string()));
        }

        if header.size as usize > backend.region.len() {
            return Err(Error::InvalidHeader(
                format!("backend of {} bytes in a region of {} bytes", header.size, backend.region.len())));
        }

        if BackendKind::from_raw(header.kind, header.device).is_none() {
            return Err(Error::InvalidHeader(format!("unknown backend kind {}", header.kind)));
        }

        Ok(backend)
    }

    /// Returns whether the region holds a backend header.
    pub fn is_formatted(region: &dyn Region) -> bool {
        if region.len() < BACKEND_HEADER_SIZE {
            return false;
        }

        //  Safety:
        //  -   The region is large enough, and suitably aligned.
        let header = unsafe { &*(region.as_ptr().as_ptr() as *const BackendHeader) };

        header.magic.load(Ordering::Acquire) == BACKEND_MAGIC
    }

    /// Associates the device-resident copy of the backend.
    ///
    /// The first association records the copy in the header, so that attaching participants may open it.
    pub fn with_mirror(mut self, mirror: Box<dyn Region>) -> Result<Backend> {
        let locator = mirror.locator()
            .ok_or_else(|| Error::InvalidHeader("mirror without IPC handle".to_string()))?;
        let handle: IpcMemHandle = locator.parse()?;

        if mirror.len() < self.len() {
            return Err(Error::RegionTooSmall { size: mirror.len(), minimum: self.len() });
        }

        let header = self.header();

        if header.flags.load(Ordering::Acquire) & BackendHeader::MIRRORED == 0 {
            header.mirror_device.store(handle.device.value(), Ordering::Relaxed);
            header.mirror_key.store(handle.key, Ordering::Relaxed);
            header.mirror_size.store(mirror.len() as u64, Ordering::Relaxed);
            header.flags.fetch_or(BackendHeader::MIRRORED, Ordering::Release);
        }

        self.mirror = Some(mirror);
        Ok(self)
    }

    /// Makes this view responsible for releasing the region.
    pub fn own(&self) { self.owned.store(true, Ordering::Release) }

    /// Relieves this view of the responsibility of releasing the region.
    pub fn disown(&self) { self.owned.store(false, Ordering::Release) }

    /// Returns whether this view is responsible for releasing the region.
    pub fn is_owned(&self) -> bool { self.owned.load(Ordering::Acquire) }

    /// Marks the backend as holding an allocator.
    pub fn set_has_allocator(&self) { self.set_flag(BackendHeader::HAS_ALLOCATOR) }

    /// Returns whether the backend holds an allocator.
    pub fn has_allocator(&self) -> bool { self.has_flag(BackendHeader::HAS_ALLOCATOR) }

    /// Marks the backend as holding an allocator created by a device.
    pub fn set_has_device_allocator(&self) { self.set_flag(BackendHeader::HAS_DEVICE_ALLOCATOR) }

    /// Returns whether the backend holds an allocator created by a device.
    pub fn has_device_allocator(&self) -> bool { self.has_flag(BackendHeader::HAS_DEVICE_ALLOCATOR) }

    /// Marks the backend as scanned by this view.
    ///
    /// Returns true if, and only if, this call did mark it.
    pub fn mark_scanned(&self) -> bool { !self.scanned.fetch_or(true, Ordering::AcqRel) }

    /// Returns whether the backend was scanned by this view.
    pub fn is_scanned(&self) -> bool { self.scanned.load(Ordering::Acquire) }

    /// Returns whether the backend is mirrored to a device.
    pub fn is_mirrored(&self) -> bool { self.has_flag(BackendHeader::MIRRORED) }

    /// Returns the device-resident copy recorded in the header, if any.
    pub fn mirror(&self) -> Option<Mirror> {
        if !self.is_mirrored() {
            return None;
        }

        let header = self.header();
        let device = DeviceId::new(header.mirror_device.load(Ordering::Relaxed));
        let key = header.mirror_key.load(Ordering::Relaxed);
        let size = header.mirror_size.load(Ordering::Relaxed) as usize;

        Some(Mirror { handle: IpcMemHandle { device, key }, size })
    }

    /// Returns the identifier.
    pub fn id(&self) -> BackendId { BackendId::new(self.header().id) }

    /// Returns the kind.
    pub fn kind(&self) -> BackendKind {
        let header = self.header();

        //  Validated on construction.
        BackendKind::from_raw(header.kind, header.device).unwrap_or(BackendKind::Local)
    }

    /// Returns the usable size, header included.
    pub fn size(&self) -> usize { self.header().size as usize }

    /// Returns the base address of the backend in the current address space.
    pub fn base(&self) -> NonNull<u8> { self.region.as_ptr() }

    /// Returns the length of the mapped region.
    pub fn len(&self) -> usize { self.region.len() }

    /// Returns whether the region is empty; never true for a formatted backend.
    pub fn is_empty(&self) -> bool { self.region.is_empty() }

    /// Returns whether `ptr` lies within the backend.
    pub fn contains(&self, ptr: *const u8) -> bool { is_within(self.base().as_ptr(), self.size(), ptr) }

    /// Returns the locator of the region, if any.
    pub fn locator(&self) -> Option<String> { self.region.locator() }

    //  Returns the device, address, and size of the device-resident view of the backend, if any.
    pub(crate) fn device_view(&self) -> Option<(DeviceId, NonNull<u8>, usize)> {
        match self.kind() {
            BackendKind::Device(device) => Some((device, self.base(), self.size())),
            BackendKind::DeviceMirror(device) =>
                self.mirror.as_ref().map(|mirror| (device, mirror.as_ptr(), self.size())),
            _ => None,
        }
    }

    fn new(region: Box<dyn Region>) -> Self {
        Backend { region, mirror: None, owned: AtomicBool::new(false), scanned: AtomicBool::new(false) }
    }

    fn check_size(region: &dyn Region) -> Result<()> {
        if region.len() < BACKEND_HEADER_SIZE {
            return Err(Error::RegionTooSmall { size: region.len(), minimum: BACKEND_HEADER_SIZE });
        }

        Ok(())
    }

    fn header(&self) -> &BackendHeader {
        //  Safety:
        //  -   The region is at least `BACKEND_HEADER_SIZE` bytes, as checked on construction.
        //  -   The region is suitably aligned.
        unsafe { &*(self.region.as_ptr().as_ptr() as *const BackendHeader) }
    }

    fn set_flag(&self, flag: u32) { self.header().flags.fetch_or(flag, Ordering::Release); }

    fn has_flag(&self, flag: u32) -> bool { self.header().flags.load(Ordering::Acquire) & flag != 0 }
}

impl Drop for Backend {
    fn drop(&mut self) {
        if !self.is_owned() {
            return;
        }

        if let Some(mirror) = &self.mirror {
            if let Err(error) = mirror.destroy() {
                warn!("Could not release the mirror of {}: {}", self.id(), error);
            }
        }

        if let Err(error) = self.region.destroy() {
            warn!("Could not release {}: {}", self.id(), error);
        }
    }
}

//  Header of a backend, at the very start of its region.
#[repr(C)]
struct BackendHeader {
    magic: AtomicU64,
    id: u32,
    kind: u32,
    device: u32,
    flags: AtomicU32,
    size: u64,
    mirror_device: AtomicU32,
    _padding: u32,
    mirror_key: AtomicU64,
    mirror_size: AtomicU64,
    _reserved: u64,
}

impl BackendHeader {
    const HAS_ALLOCATOR: u32 = 1 << 0;
    const HAS_DEVICE_ALLOCATOR: u32 = 1 << 1;
    const MIRRORED: u32 = 1 << 2;
}

const _: () = assert!(mem::size_of::<BackendHeader>() == BACKEND_HEADER_SIZE);
