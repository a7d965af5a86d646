//! Implementation of Linux specific calls.

use std::{
    ffi::CString,
    fs::{File, OpenOptions},
    io,
    os::unix::io::AsRawFd,
    path::PathBuf,
    ptr::{self, NonNull},
    sync::Arc,
    thread,
    time::Duration,
};

use log::{debug, warn};

use shmalloc_core::{
    BackendKind, DeviceId, DeviceRuntime, Error, IpcMemHandle, NoDevices, Platform, Region, Result, ThreadId,
    ThreadModel,
};

/// Implementation of the Platform trait, for Linux.
pub struct ShmPlatform {
    devices: Arc<dyn DeviceRuntime>,
    thread_model: Arc<ShmThreadModel>,
}

impl ShmPlatform {
    /// Creates an instance, without devices.
    pub fn new() -> Self { Self::with_devices(Arc::new(NoDevices)) }

    /// Creates an instance, over the given device runtime.
    pub fn with_devices(devices: Arc<dyn DeviceRuntime>) -> Self {
        Self { devices, thread_model: Arc::new(ShmThreadModel) }
    }

    //  Creates the host half of a mirrored backend, shared if named.
    fn create_host_region(&self, size: usize, locator: Option<&str>) -> Result<Box<dyn Region>> {
        let region: Box<dyn Region> = match locator {
            Some(name) => Box::new(SharedRegion::create(name, size)?),
            None => Box::new(AnonymousRegion::new(size)?),
        };

        //  Safety:
        //  -   The region remains mapped for as long as the backend lives.
        unsafe { self.devices.register_host(region.as_ptr(), region.len())? };

        Ok(region)
    }
}

impl Default for ShmPlatform {
    fn default() -> Self { Self::new() }
}

impl Platform for ShmPlatform {
    fn create_region(&self, kind: BackendKind, size: usize, locator: Option<&str>) -> Result<Box<dyn Region>> {
        match kind {
            BackendKind::Local => Ok(Box::new(AnonymousRegion::new(size)?)),
            BackendKind::PosixShm => Ok(Box::new(SharedRegion::create(required(kind, locator)?, size)?)),
            BackendKind::MappedFile => Ok(Box::new(FileRegion::create(required(kind, locator)?, size)?)),
            BackendKind::Device(device) => Ok(Box::new(DeviceRegion::create(self.devices.clone(), device, size)?)),
            BackendKind::DeviceMirror(_) => self.create_host_region(size, locator),
        }
    }

    fn open_region(&self, kind: BackendKind, locator: &str) -> Result<Box<dyn Region>> {
        match kind {
            BackendKind::Local => Err(Error::UnsupportedBackend(kind)),
            BackendKind::PosixShm => Ok(Box::new(SharedRegion::open(locator)?)),
            BackendKind::MappedFile => Ok(Box::new(FileRegion::open(locator)?)),
            BackendKind::Device(_) => Ok(Box::new(DeviceRegion::open(self.devices.clone(), locator.parse()?)?)),
            BackendKind::DeviceMirror(_) => {
                let region = SharedRegion::open(locator)?;

                //  Safety:
                //  -   The region remains mapped for as long as the backend lives.
                unsafe { self.devices.register_host(region.as_ptr(), region.len())? };

                Ok(Box::new(region))
            },
        }
    }

    fn devices(&self) -> &dyn DeviceRuntime { &*self.devices }

    fn thread_model(&self) -> Arc<dyn ThreadModel> { self.thread_model.clone() }
}

/// Implementation of the ThreadModel trait, for Linux.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShmThreadModel;

impl ThreadModel for ShmThreadModel {
    fn yield_now(&self) {
        //  Safety:
        //  -   `sched_yield` has no precondition.
        unsafe { libc::sched_yield() };
    }

    fn sleep_for_us(&self, us: u64) { thread::sleep(Duration::from_micros(us)) }

    fn current_thread_id(&self) -> ThreadId {
        //  Safety:
        //  -   `pthread_self` has no precondition.
        ThreadId::new(unsafe { libc::pthread_self() } as u64)
    }
}

//  Private anonymous memory.
struct AnonymousRegion {
    pointer: NonNull<u8>,
    size: usize,
}

impl AnonymousRegion {
    fn new(size: usize) -> Result<Self> {
        let pointer = mmap_allocate(size, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS, -1)?;

        Ok(Self { pointer, size })
    }
}

impl Region for AnonymousRegion {
    fn as_ptr(&self) -> NonNull<u8> { self.pointer }

    fn len(&self) -> usize { self.size }
}

impl Drop for AnonymousRegion {
    fn drop(&mut self) {
        //  Safety:
        //  -   `self.pointer` was `mmap`ed with `self.size` bytes, and is no longer in use.
        unsafe { munmap_deallocate(self.pointer.as_ptr(), self.size) };
    }
}

//  POSIX shared memory segment.
struct SharedRegion {
    pointer: NonNull<u8>,
    size: usize,
    name: String,
    fd: libc::c_int,
}

impl SharedRegion {
    //  Creates the segment, replacing any stale segment of the same name.
    fn create(name: &str, size: usize) -> Result<Self> {
        let name = segment_name(name);
        let c_name = c_string(&name)?;

        //  Safety:
        //  -   `c_name` is a valid C string.
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } == 0 {
            debug!("Unlinked stale segment {}", name);
        }

        //  Safety:
        //  -   `c_name` is a valid C string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o666) };

        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        //  Safety:
        //  -   `fd` is a valid file descriptor.
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let error = io::Error::last_os_error();

            //  Safety:
            //  -   `fd` is a valid file descriptor, and `c_name` a valid C string.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }

            return Err(error.into());
        }

        Self::map(name, fd, size)
    }

    fn open(name: &str) -> Result<Self> {
        let name = segment_name(name);
        let c_name = c_string(&name)?;

        //  Safety:
        //  -   `c_name` is a valid C string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o666) };

        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        //  Safety:
        //  -   `libc::stat` is plain old data.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };

        //  Safety:
        //  -   `fd` is a valid file descriptor, and `stat` is valid for writes.
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            let error = io::Error::last_os_error();

            //  Safety:
            //  -   `fd` is a valid file descriptor.
            unsafe { libc::close(fd) };

            return Err(error.into());
        }

        Self::map(name, fd, stat.st_size as usize)
    }

    fn map(name: String, fd: libc::c_int, size: usize) -> Result<Self> {
        match mmap_allocate(size, libc::MAP_SHARED, fd) {
            Ok(pointer) => Ok(Self { pointer, size, name, fd }),
            Err(error) => {
                //  Safety:
                //  -   `fd` is a valid file descriptor.
                unsafe { libc::close(fd) };
                Err(error)
            },
        }
    }
}

impl Region for SharedRegion {
    fn as_ptr(&self) -> NonNull<u8> { self.pointer }

    fn len(&self) -> usize { self.size }

    fn locator(&self) -> Option<String> { Some(self.name.clone()) }

    fn destroy(&self) -> Result<()> {
        let c_name = c_string(&self.name)?;

        //  Safety:
        //  -   `c_name` is a valid C string.
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error().into());
        }

        debug!("Unlinked segment {}", self.name);
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        //  Safety:
        //  -   `self.pointer` was `mmap`ed with `self.size` bytes, and is no longer in use.
        //  -   `self.fd` is a valid file descriptor.
        unsafe {
            munmap_deallocate(self.pointer.as_ptr(), self.size);
            libc::close(self.fd);
        }
    }
}

//  Memory-mapped file, persisting after the mapping is released.
struct FileRegion {
    pointer: NonNull<u8>,
    size: usize,
    path: PathBuf,
    _file: File,
}

impl FileRegion {
    fn create(path: &str, size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        file.set_len(size as u64)?;

        Self::map(path.into(), file, size)
    }

    fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len() as usize;

        Self::map(path.into(), file, size)
    }

    fn map(path: PathBuf, file: File, size: usize) -> Result<Self> {
        let pointer = mmap_allocate(size, libc::MAP_SHARED, file.as_raw_fd())?;

        Ok(Self { pointer, size, path, _file: file })
    }
}

impl Region for FileRegion {
    fn as_ptr(&self) -> NonNull<u8> { self.pointer }

    fn len(&self) -> usize { self.size }

    fn locator(&self) -> Option<String> { Some(self.path.display().to_string()) }
}

impl Drop for FileRegion {
    fn drop(&mut self) {
        //  Safety:
        //  -   `self.pointer` was `mmap`ed with `self.size` bytes, and is no longer in use.
        unsafe { munmap_deallocate(self.pointer.as_ptr(), self.size) };
    }
}

//  Memory of a device.
struct DeviceRegion {
    devices: Arc<dyn DeviceRuntime>,
    device: DeviceId,
    pointer: NonNull<u8>,
    size: usize,
    handle: IpcMemHandle,
}

impl DeviceRegion {
    fn create(devices: Arc<dyn DeviceRuntime>, device: DeviceId, size: usize) -> Result<Self> {
        devices.set_device(device)?;

        let pointer = devices.malloc(size)?;

        //  Safety:
        //  -   `pointer` was just allocated with `size` bytes.
        unsafe { devices.memset(pointer, 0, size)? };

        let handle = devices.export_ipc_handle(pointer)?;

        Ok(Self { devices, device, pointer, size, handle })
    }

    fn open(devices: Arc<dyn DeviceRuntime>, handle: IpcMemHandle) -> Result<Self> {
        devices.set_device(handle.device)?;

        let (pointer, size) = devices.open_ipc_handle(handle)?;

        Ok(Self { devices, device: handle.device, pointer, size, handle })
    }
}

impl Region for DeviceRegion {
    fn as_ptr(&self) -> NonNull<u8> { self.pointer }

    fn len(&self) -> usize { self.size }

    fn locator(&self) -> Option<String> { Some(self.handle.to_string()) }

    fn destroy(&self) -> Result<()> {
        self.devices.set_device(self.device)?;

        //  Safety:
        //  -   `self.pointer` was allocated by `malloc`, and is only freed by its owner, once.
        unsafe { self.devices.free(self.pointer) }
    }
}

//  Safety:
//  -   Concurrent accesses to the content are synchronized by the structures formatted within.
unsafe impl Send for AnonymousRegion {}
unsafe impl Sync for AnonymousRegion {}
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}
unsafe impl Send for FileRegion {}
unsafe impl Sync for FileRegion {}
unsafe impl Send for DeviceRegion {}
unsafe impl Sync for DeviceRegion {}

fn required(kind: BackendKind, locator: Option<&str>) -> Result<&str> {
    locator.ok_or_else(|| {
        Error::Io(io::Error::new(io::ErrorKind::InvalidInput, format!("{:?} backends require a locator", kind)))
    })
}

//  POSIX shared memory names start with a single slash.
fn segment_name(name: &str) -> String {
    if name.starts_with('/') { name.to_string() } else { format!("/{}", name) }
}

fn c_string(text: &str) -> Result<CString> {
    CString::new(text).map_err(|error| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, error)))
}

//  Wrapper around `mmap`.
//
//  Returns a pointer to `size` bytes of memory, aligned on the page size.
fn mmap_allocate(size: usize, flags: libc::c_int, fd: libc::c_int) -> Result<NonNull<u8>> {
    let length = size;
    let prot = libc::PROT_READ | libc::PROT_WRITE;

    //  No specific address hint.
    let addr = ptr::null_mut();
    //  Always map from the start of the file, if any.
    let offset = 0;

    //  Safety:
    //  -   `addr`, `fd`, and `offset` are suitable for `flags`.
    let result = unsafe { libc::mmap(addr, length, prot, flags, fd, offset) };

    if result == libc::MAP_FAILED {
        return Err(io::Error::last_os_error().into());
    }

    NonNull::new(result as *mut u8).ok_or_else(|| Error::OutOfMemory { requested: size, available: 0 })
}

//  Wrapper around `munmap`.
//
//  #   Safety
//
//  -   Assumes that `addr` points to a `mmap`ed area of at least `size` bytes.
//  -   Assumes that the range `[addr, addr + size)` is no longer in use.
unsafe fn munmap_deallocate(addr: *mut u8, size: usize) {
    let result = libc::munmap(addr as *mut libc::c_void, size);

    if result != 0 {
        warn!("Could not munmap {:x}, {}: {}", addr as usize, size, io::Error::last_os_error());
    }
}
