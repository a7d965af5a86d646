//! An accelerator runtime emulated in host memory.
//!
//! Each emulated device executes kernels within its own device-context MemoryManager. Kernels are executed at launch,
//! on the launching thread, and their failures are reported by the next synchronization of the device.
//!
//! Device memory is host memory: it is addressable by the host, and by any thread of the process. Freed device memory
//! is only reclaimed when the runtime is dropped, as device-context registrations may still refer to it.

use std::{
    alloc::{self, Layout},
    cell::Cell,
    collections::HashMap,
    ptr::{self, NonNull},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::{debug, warn};
use parking_lot::Mutex;

use shmalloc_core::{
    Configuration, DeviceId, DevicePlatform, DeviceRuntime, Error, IpcMemHandle, Kernel, MemoryManager, Result,
};

use crate::ShmConfiguration;

thread_local! {
    static CURRENT_DEVICE: Cell<u32> = Cell::new(0);
}

/// EmulatedDevices
///
/// A DeviceRuntime emulating a number of devices in host memory.
pub struct EmulatedDevices<C: Configuration = ShmConfiguration> {
    devices: Box<[EmulatedDevice<C>]>,
    allocations: Mutex<HashMap<u64, Allocation>>,
    released: Mutex<Vec<Allocation>>,
    next_key: AtomicU64,
}

impl<C: Configuration> EmulatedDevices<C> {
    /// Creates `count` devices.
    pub fn new(count: usize) -> Result<Self> {
        let devices = (0..count)
            .map(|index| EmulatedDevice::new(DeviceId::new(index as u32)))
            .collect::<Result<Vec<_>>>()?
            .into_boxed_slice();

        Ok(Self {
            devices,
            allocations: Mutex::new(HashMap::new()),
            released: Mutex::new(Vec::new()),
            next_key: AtomicU64::new(1),
        })
    }

    /// Returns the MemoryManager of the device context, if the device exists.
    pub fn manager(&self, device: DeviceId) -> Option<&MemoryManager<C>> {
        self.devices.get(device.value() as usize).map(|device| &device.manager)
    }

    fn device(&self, device: DeviceId) -> Result<&EmulatedDevice<C>> {
        self.devices.get(device.value() as usize).ok_or_else(|| Error::Device(format!("no such device: {}", device)))
    }

    fn current(&self) -> Result<&EmulatedDevice<C>> { self.device(self.current_device()) }
}

impl<C: Configuration> DeviceRuntime for EmulatedDevices<C> {
    fn device_count(&self) -> usize { self.devices.len() }

    fn set_device(&self, device: DeviceId) -> Result<()> {
        self.device(device)?;

        CURRENT_DEVICE.with(|current| current.set(device.value()));
        Ok(())
    }

    fn current_device(&self) -> DeviceId { DeviceId::new(CURRENT_DEVICE.with(Cell::get)) }

    fn synchronize(&self) -> Result<()> {
        match self.current()?.failure.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn malloc(&self, size: usize) -> Result<NonNull<u8>> {
        let device = self.current_device();
        self.device(device)?;

        let allocation = Allocation::new(device, size)?;
        let pointer = allocation.pointer;
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);

        self.allocations.lock().insert(key, allocation);

        debug!("Allocated {} bytes on {} ({:x})", size, device, pointer.as_ptr() as usize);
        Ok(pointer)
    }

    unsafe fn free(&self, pointer: NonNull<u8>) -> Result<()> {
        let mut allocations = self.allocations.lock();

        let key = find_key(&allocations, pointer)?;

        if let Some(allocation) = allocations.remove(&key) {
            self.released.lock().push(allocation);
        }

        Ok(())
    }

    unsafe fn memcpy(&self, dst: NonNull<u8>, src: NonNull<u8>, len: usize) -> Result<()> {
        ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), len);
        Ok(())
    }

    unsafe fn memset(&self, dst: NonNull<u8>, value: u8, len: usize) -> Result<()> {
        ptr::write_bytes(dst.as_ptr(), value, len);
        Ok(())
    }

    fn export_ipc_handle(&self, pointer: NonNull<u8>) -> Result<IpcMemHandle> {
        let allocations = self.allocations.lock();

        let key = find_key(&allocations, pointer)?;

        Ok(IpcMemHandle { device: allocations[&key].device, key })
    }

    fn open_ipc_handle(&self, handle: IpcMemHandle) -> Result<(NonNull<u8>, usize)> {
        self.allocations
            .lock()
            .get(&handle.key)
            .filter(|allocation| allocation.device == handle.device)
            .map(|allocation| (allocation.pointer, allocation.size))
            .ok_or_else(|| Error::Device(format!("no such allocation: {}", handle)))
    }

    //  Host memory is device memory.
    unsafe fn register_host(&self, _: NonNull<u8>, _: usize) -> Result<()> { Ok(()) }

    fn launch(&self, kernel: Kernel) -> Result<()> {
        let device = self.current()?;

        //  Safety:
        //  -   The regions of `RegisterBackend` kernels are allocations of this runtime, which are only reclaimed on
        //      drop, after the device-context managers.
        if let Err(error) = unsafe { device.manager.execute_kernel(kernel) } {
            warn!("Kernel {:?} failed on {}: {}", kernel, device.id, error);

            device.failure.lock().get_or_insert(error);
        }

        Ok(())
    }
}

struct EmulatedDevice<C: Configuration> {
    id: DeviceId,
    manager: MemoryManager<C>,
    failure: Mutex<Option<Error>>,
}

impl<C: Configuration> EmulatedDevice<C> {
    fn new(id: DeviceId) -> Result<Self> {
        let manager = MemoryManager::for_device(id, Arc::new(DevicePlatform))?;

        Ok(Self { id, manager, failure: Mutex::new(None) })
    }
}

struct Allocation {
    device: DeviceId,
    pointer: NonNull<u8>,
    size: usize,
}

impl Allocation {
    //  Alignment of device allocations, as for pages of host memory.
    const ALIGNMENT: usize = 4096;

    fn new(device: DeviceId, size: usize) -> Result<Self> {
        let layout = Self::layout(size)?;

        //  Safety:
        //  -   `layout` has a non-zero size.
        let pointer = unsafe { alloc::alloc_zeroed(layout) };
        let pointer = NonNull::new(pointer).ok_or(Error::OutOfMemory { requested: size, available: 0 })?;

        Ok(Self { device, pointer, size })
    }

    fn layout(size: usize) -> Result<Layout> {
        Layout::from_size_align(size.max(1), Self::ALIGNMENT)
            .map_err(|_| Error::OutOfMemory { requested: size, available: 0 })
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.size) {
            //  Safety:
            //  -   `self.pointer` was allocated with this very layout.
            unsafe { alloc::dealloc(self.pointer.as_ptr(), layout) };
        }
    }
}

//  Safety:
//  -   The allocation is plain memory, accesses to which are synchronized by its users.
unsafe impl Send for Allocation {}

fn find_key(allocations: &HashMap<u64, Allocation>, pointer: NonNull<u8>) -> Result<u64> {
    allocations
        .iter()
        .find(|(_, allocation)| allocation.pointer == pointer)
        .map(|(key, _)| *key)
        .ok_or_else(|| Error::Device(format!("no allocation at {:x}", pointer.as_ptr() as usize)))
}

#[cfg(test)]
mod tests {

use shmalloc_core::BackendId;

use super::*;

type Devices = EmulatedDevices<ShmConfiguration>;

#[test]
fn emulated_devices_select() {
    let devices = Devices::new(2).expect("Devices");

    assert_eq!(2, devices.device_count());

    devices.set_device(DeviceId::new(1)).expect("Device 1");
    assert_eq!(DeviceId::new(1), devices.current_device());

    assert!(matches!(devices.set_device(DeviceId::new(2)), Err(Error::Device(_))));
    assert_eq!(DeviceId::new(1), devices.current_device());

    assert_eq!(Some(DeviceId::new(1)), devices.manager(DeviceId::new(1)).and_then(|m| m.device()));
    assert!(devices.manager(DeviceId::new(2)).is_none());
}

#[test]
fn emulated_devices_ipc_handles() {
    let devices = Devices::new(1).expect("Devices");
    devices.set_device(DeviceId::new(0)).expect("Device 0");

    let pointer = devices.malloc(4096).expect("Allocation");
    let handle = devices.export_ipc_handle(pointer).expect("Handle");

    assert_eq!(DeviceId::new(0), handle.device);
    assert_eq!(Ok((pointer, 4096)), devices.open_ipc_handle(handle).map_err(|e| e.to_string()));

    let forged = IpcMemHandle { device: DeviceId::new(3), key: handle.key };
    assert!(devices.open_ipc_handle(forged).is_err());

    //  Safety:
    //  -   `pointer` was allocated above, and freed only once.
    unsafe { devices.free(pointer).expect("Free") };

    assert!(devices.open_ipc_handle(handle).is_err());
    //  Safety:
    //  -   `free` reports unknown pointers.
    assert!(unsafe { devices.free(pointer) }.is_err());
}

#[test]
fn emulated_devices_memcpy_memset() {
    let devices = Devices::new(1).expect("Devices");
    devices.set_device(DeviceId::new(0)).expect("Device 0");

    let source = devices.malloc(64).expect("Source");
    let destination = devices.malloc(64).expect("Destination");

    //  Safety:
    //  -   Both allocations are 64 bytes, and distinct.
    unsafe {
        devices.memset(source, 0xAB, 64).expect("Memset");
        devices.memcpy(destination, source, 64).expect("Memcpy");

        assert_eq!(0xAB, destination.as_ptr().add(63).read());
    }
}

#[test]
fn emulated_devices_report_failures_on_synchronize() {
    let devices = Devices::new(1).expect("Devices");
    devices.set_device(DeviceId::new(0)).expect("Device 0");

    let region = devices.malloc(16).expect("Allocation");
    let kernel = Kernel::RegisterBackend {
        id: BackendId::new(1),
        kind: shmalloc_core::BackendKind::Device(DeviceId::new(0)),
        region,
        size: 16,
    };

    devices.launch(kernel).expect("Launch");

    assert!(matches!(devices.synchronize(), Err(Error::RegionTooSmall { .. })));
    assert!(devices.synchronize().is_ok());
}

#[test]
fn emulated_devices_register_backend() {
    let devices = Devices::new(1).expect("Devices");
    devices.set_device(DeviceId::new(0)).expect("Device 0");

    let region = devices.malloc(64 * 1024).expect("Allocation");
    let kernel = Kernel::RegisterBackend {
        id: BackendId::new(1),
        kind: shmalloc_core::BackendKind::Device(DeviceId::new(0)),
        region,
        size: 64 * 1024,
    };

    devices.launch(kernel).expect("Launch");
    devices.synchronize().expect("Synchronize");

    let manager = devices.manager(DeviceId::new(0)).expect("Manager");
    let backend = manager.get_backend(BackendId::new(1)).expect("Registered");

    assert_eq!(region, backend.base());
    assert!(backend.is_owned());
}

}
