//! The accelerator device runtime consumed by shmalloc.
//!
//! Registration on a device is a remote procedure call into the device context: the host selects the device, launches
//! one of the closed set of `Kernel`s, and synchronizes before trusting the result.

use core::{fmt, ptr::NonNull, str::FromStr};

use super::{AllocatorId, AllocatorKind, BackendId, BackendKind, Error, Result};

/// DeviceId
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd, Eq, Ord, Hash)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Creates a DeviceId.
    pub const fn new(value: u32) -> Self { Self(value) }

    /// Retrieves the value.
    pub const fn value(&self) -> u32 { self.0 }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "device#{}", self.0) }
}

/// IpcMemHandle
///
/// Handle of a device allocation, which other processes may open; formatted as `<device>:<key>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IpcMemHandle {
    /// Device holding the allocation.
    pub device: DeviceId,
    /// Runtime-specific key of the allocation.
    pub key: u64,
}

impl fmt::Display for IpcMemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}:{}", self.device.value(), self.key) }
}

impl FromStr for IpcMemHandle {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let invalid = || Error::Parse(format!("invalid IPC handle: {}", text));

        let (device, key) = text.split_once(':').ok_or_else(invalid)?;
        let device = device.parse::<u32>().map_err(|_| invalid())?;
        let key = key.parse::<u64>().map_err(|_| invalid())?;

        Ok(IpcMemHandle { device: DeviceId::new(device), key })
    }
}

/// Kernel
///
/// The closed set of registration procedures executed within the device context.
#[derive(Clone, Copy, Debug)]
pub enum Kernel {
    /// Registers the backend whose device-resident copy is at `region`, formatting it if it holds no valid header.
    RegisterBackend {
        /// Identifier of the backend.
        id: BackendId,
        /// Kind of the backend.
        kind: BackendKind,
        /// Device-resident region.
        region: NonNull<u8>,
        /// Size of the region.
        size: usize,
    },
    /// Marks a registered backend as holding an allocator.
    SetBackendHasAllocator(BackendId),
    /// Creates an allocator within a registered backend.
    CreateAllocator {
        /// Identifier of the backend.
        backend_id: BackendId,
        /// Identifier of the allocator.
        alloc_id: AllocatorId,
        /// Size of the custom header.
        custom_header_size: usize,
        /// Kind of the allocator.
        kind: AllocatorKind,
    },
    /// Scans the backends registered on the device.
    ScanBackends,
}

//  Safety:
//  -   The region pointer is only dereferenced within the device context it designates.
unsafe impl Send for Kernel {}

/// DeviceRuntime
///
/// Capability interface over an accelerator runtime.
///
/// Device allocations are assumed to be addressable from the host, as is the case of managed or host-registered
/// memory.
pub trait DeviceRuntime: Send + Sync {
    /// Returns the number of devices.
    fn device_count(&self) -> usize;

    /// Selects the device targeted by subsequent calls from this thread.
    fn set_device(&self, device: DeviceId) -> Result<()>;

    /// Returns the device targeted by calls from this thread.
    fn current_device(&self) -> DeviceId;

    /// Waits for the completion of all launched kernels of the current device.
    ///
    /// Reports the first failure of those kernels, if any.
    fn synchronize(&self) -> Result<()>;

    /// Allocates `size` bytes on the current device.
    fn malloc(&self, size: usize) -> Result<NonNull<u8>>;

    /// Frees an allocation of the current device.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `ptr` was returned by `malloc` and not freed since.
    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<()>;

    /// Copies `len` bytes, from host or device memory, to host or device memory.
    ///
    /// #   Safety
    ///
    /// -   Assumes that both ranges are valid, and do not overlap.
    unsafe fn memcpy(&self, dst: NonNull<u8>, src: NonNull<u8>, len: usize) -> Result<()>;

    /// Fills `len` bytes of device memory with `value`.
    ///
    /// #   Safety
    ///
    /// -   Assumes that the range is valid.
    unsafe fn memset(&self, dst: NonNull<u8>, value: u8, len: usize) -> Result<()>;

    /// Exports a handle through which other processes may open the allocation.
    fn export_ipc_handle(&self, ptr: NonNull<u8>) -> Result<IpcMemHandle>;

    /// Opens an allocation exported by `export_ipc_handle`, returning its address and size.
    fn open_ipc_handle(&self, handle: IpcMemHandle) -> Result<(NonNull<u8>, usize)>;

    /// Makes a host range accessible to the devices.
    ///
    /// #   Safety
    ///
    /// -   Assumes that the range remains valid until the process exits.
    unsafe fn register_host(&self, ptr: NonNull<u8>, len: usize) -> Result<()>;

    /// Launches a kernel on the current device, without waiting for its completion.
    fn launch(&self, kernel: Kernel) -> Result<()>;
}

/// NoDevices
///
/// A runtime without any device.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDevices;

impl NoDevices {
    fn unavailable<T>() -> Result<T> { Err(Error::Device("no device available".to_string())) }
}

impl DeviceRuntime for NoDevices {
    fn device_count(&self) -> usize { 0 }

    fn set_device(&self, _: DeviceId) -> Result<()> { Self::unavailable() }

    fn current_device(&self) -> DeviceId { DeviceId::default() }

    fn synchronize(&self) -> Result<()> { Ok(()) }

    fn malloc(&self, _: usize) -> Result<NonNull<u8>> { Self::unavailable() }

    unsafe fn free(&self, _: NonNull<u8>) -> Result<()> { Self::unavailable() }

    unsafe fn memcpy(&self, _: NonNull<u8>, _: NonNull<u8>, _: usize) -> Result<()> { Self::unavailable() }

    unsafe fn memset(&self, _: NonNull<u8>, _: u8, _: usize) -> Result<()> { Self::unavailable() }

    fn export_ipc_handle(&self, _: NonNull<u8>) -> Result<IpcMemHandle> { Self::unavailable() }

    fn open_ipc_handle(&self, _: IpcMemHandle) -> Result<(NonNull<u8>, usize)> { Self::unavailable() }

    unsafe fn register_host(&self, _: NonNull<u8>, _: usize) -> Result<()> { Ok(()) }

    fn launch(&self, _: Kernel) -> Result<()> { Self::unavailable() }
}
