//! The registry of backends and allocators.
//!
//! A MemoryManager binds backend identifiers to backends, and allocator identifiers to allocators, in fixed-size tables
//! indexed by identifier. Allocators created by other participants are discovered by scanning the registered
//! backends: the header of each backend tells whether it holds an allocator, and the header of the allocator tells how
//! to use it.
//!
//! There is one MemoryManager per address space: one for the host process, and one for each device context. The host
//! manager drives the managers of the devices through the `Kernel`s of the device runtime.

use core::marker::PhantomData;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::RwLock;

use super::{
    Allocator, AllocatorId, AllocatorKind, ArrayRegion, Backend, BackendId, BackendKind, Configuration,
    DefaultConfiguration, DeviceId, Error, Kernel, Platform, Pointer, Region, Result,
};

/// MemoryManager
pub struct MemoryManager<C: Configuration = DefaultConfiguration> {
    backends: Box<[RwLock<Option<Arc<Backend>>>]>,
    allocators: Box<[RwLock<Option<Arc<Allocator>>>]>,
    root_backend: Arc<Backend>,
    root_allocator: Arc<Allocator>,
    default_allocator: RwLock<Arc<Allocator>>,
    platform: Arc<dyn Platform>,
    context: Context,
    _configuration: PhantomData<C>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Context {
    Host,
    Device(DeviceId),
}

impl<C: Configuration> MemoryManager<C> {
    /// Creates the MemoryManager of the host process.
    ///
    /// The root backend, a private region of `C::ROOT_REGION_SIZE` bytes, is registered with the root Stack allocator
    /// formatted within; the root allocator is the default allocator until another is registered.
    pub fn new(platform: Arc<dyn Platform>) -> Result<Self> { Self::with_context(platform, Context::Host) }

    /// Creates the MemoryManager of a device context.
    pub fn for_device(device: DeviceId, platform: Arc<dyn Platform>) -> Result<Self> {
        Self::with_context(platform, Context::Device(device))
    }

    fn with_context(platform: Arc<dyn Platform>, context: Context) -> Result<Self> {
        let backends = (0..C::MAX_BACKENDS).map(|_| RwLock::new(None)).collect();
        let allocators = (0..C::MAX_ALLOCATORS).map(|_| RwLock::new(None)).collect();

        let region = Box::new(ArrayRegion::with_capacity(C::ROOT_REGION_SIZE)?);
        let root_backend = Arc::new(Backend::shm_init(BackendId::ROOT, BackendKind::Local, region)?);
        root_backend.own();

        let root_allocator = Arc::new(Allocator::shm_init(
            AllocatorKind::Stack, AllocatorId::ROOT, 0, root_backend.clone(), platform.thread_model())?);
        root_backend.set_has_allocator();
        root_backend.mark_scanned();

        let manager = MemoryManager {
            backends,
            allocators,
            root_backend: root_backend.clone(),
            root_allocator: root_allocator.clone(),
            default_allocator: RwLock::new(root_allocator.clone()),
            platform,
            context,
            _configuration: PhantomData,
        };

        manager.register_backend(root_backend)?;
        manager.register_allocator_no_scan(root_allocator)?;

        debug!("Initialized memory manager of {:?}", context);

        Ok(manager)
    }

    /// Returns the platform.
    pub fn platform(&self) -> &Arc<dyn Platform> { &self.platform }

    /// Returns the device of a device-context manager, or None for the host manager.
    pub fn device(&self) -> Option<DeviceId> {
        match self.context {
            Context::Host => None,
            Context::Device(device) => Some(device),
        }
    }

    /// Creates a backend of `size` bytes, owned by this manager.
    ///
    /// The locator names the backend for kinds which require one, such as shared memory segments or files. A
    /// device-mirrored backend is paired with its device-resident copy right away, and device-resident backends are
    /// registered on their device.
    pub fn create_backend(&self, id: BackendId, size: usize, kind: BackendKind, locator: Option<&str>)
        -> Result<Arc<Backend>>
    {
        if self.backend_slot(id)?.read().is_some() {
            return Err(Error::BackendExists(id));
        }

        let region = self.platform.create_region(kind, size, locator)?;
        let mut backend = Backend::shm_init(id, kind, region)?;
        backend.own();

        if let BackendKind::DeviceMirror(device) = kind {
            let mirror = self.platform.create_region(BackendKind::Device(device), size, None)?;
            backend = backend.with_mirror(mirror)?;
        }

        let backend = Arc::new(backend);
        self.register_backend(backend.clone())?;

        info!("Created {} of {} bytes ({:?}, locator: {:?})", id, size, kind, backend.locator());

        if self.is_host() && backend.device_view().is_some() {
            if let Err(error) = self.copy_backend_to_device(id) {
                self.unregister_backend(id);
                return Err(error);
            }
        }

        Ok(backend)
    }

    /// Attaches the existing backend designated by `locator`, created by another participant.
    ///
    /// The allocator formatted within, if any, is discovered immediately. The backend is not owned by this manager.
    pub fn attach_backend(&self, kind: BackendKind, locator: &str) -> Result<Arc<Backend>> {
        let region = self.platform.open_region(kind, locator)?;
        let mut backend = Backend::shm_deserialize(region)?;

        if let Some(mirror) = backend.mirror().filter(|_| self.is_host()) {
            let handle = mirror.handle.to_string();

            match self.platform.open_region(BackendKind::Device(mirror.handle.device), &handle) {
                Ok(region) => backend = backend.with_mirror(region)?,
                Err(error) => warn!("Could not open the mirror {} of {}: {}", handle, backend.id(), error),
            }
        }

        let backend = Arc::new(backend);
        let id = backend.id();

        self.register_backend(backend.clone())?;

        info!("Attached {} ({:?}, locator: {})", id, backend.kind(), locator);

        if self.is_host() && backend.device_view().is_some() {
            if let Err(error) = self.copy_backend_to_device(id) {
                warn!("Could not register {} on its device: {}", id, error);
            }
        }

        self.scan_backends();
        backend.disown();

        Ok(backend)
    }

    /// Unregisters a backend, taking ownership of it, and releases its resources once no allocator refers to it any
    /// longer.
    ///
    /// No-op if the backend is not registered, or is the root backend.
    pub fn destroy_backend(&self, id: BackendId) {
        if id.is_root() {
            warn!("The root backend cannot be destroyed");
            return;
        }

        if let Some(backend) = self.unregister_backend(id) {
            backend.own();
            info!("Destroyed {}", id);
        }
    }

    /// Creates an allocator of the given kind within the backend `backend_id`.
    ///
    /// Returns None, registering nothing, if the backend is not registered. If the default allocator is still the
    /// root allocator, the new allocator becomes the default.
    ///
    /// Once formatted, the allocator is registered even if the device-resident view of the backend cannot be refreshed;
    /// the failure is logged, and `copy_backend_to_device` may be retried.
    ///
    /// #   Panics
    ///
    /// If `alloc_id` is the null, or the root, identifier.
    pub fn create_allocator(
        &self,
        backend_id: BackendId,
        alloc_id: AllocatorId,
        custom_header_size: usize,
        kind: AllocatorKind,
    )
        -> Result<Option<Arc<Allocator>>>
    {
        Self::check_allocator_id(alloc_id);

        let backend = match self.get_backend(backend_id) {
            Some(backend) => backend,
            None => return Ok(None),
        };

        self.allocator_slot(alloc_id)?;

        let allocator = Allocator::shm_init(
            kind, alloc_id, custom_header_size, backend.clone(), self.platform.thread_model())?;
        let allocator = Arc::new(allocator);

        backend.set_has_allocator();

        if backend.kind().device().is_some() {
            backend.set_has_device_allocator();
        }

        if self.is_host() && backend.device_view().is_some() {
            if let Err(error) = self.copy_backend_to_device(backend_id) {
                warn!("Could not copy {} to its device after creating allocator {}: {}", backend_id, alloc_id, error);
            }
        }

        backend.mark_scanned();

        info!("Created allocator {} ({}) in {}", alloc_id, kind, backend_id);

        self.register_allocator(allocator).map(Some)
    }

    /// Creates an allocator within the backend `backend_id`, from within the context of `device`.
    ///
    /// The creation is only launched: failures are reported by the next synchronization of the device, and the
    /// allocator is registered by the device manager. The host manager discovers it on its next scan, if the backend
    /// is accessible from the host.
    ///
    /// #   Panics
    ///
    /// If `alloc_id` is the null, or the root, identifier.
    pub fn create_allocator_on_device(
        &self,
        device: DeviceId,
        backend_id: BackendId,
        alloc_id: AllocatorId,
        custom_header_size: usize,
        kind: AllocatorKind,
    )
        -> Result<()>
    {
        Self::check_allocator_id(alloc_id);

        let devices = self.platform.devices();
        devices.set_device(device)?;
        devices.launch(Kernel::CreateAllocator { backend_id, alloc_id, custom_header_size, kind })?;

        if let Some(backend) = self.get_backend(backend_id) {
            backend.set_has_device_allocator();
        }

        info!("Launched the creation of allocator {} ({}) in {} on {}", alloc_id, kind, backend_id, device);

        Ok(())
    }

    /// Unregisters an allocator; if it was the default allocator, the root allocator becomes the default.
    ///
    /// No-op if the allocator is not registered, or is the root allocator.
    pub fn destroy_allocator(&self, id: AllocatorId) {
        if id.is_root() {
            warn!("The root allocator cannot be destroyed");
            return;
        }

        let allocator = match self.unregister_allocator(id) {
            Some(allocator) => allocator,
            None => return,
        };

        let mut default = self.default_allocator.write();

        if Arc::ptr_eq(&*default, &allocator) {
            *default = self.root_allocator.clone();
        }

        info!("Destroyed allocator {}", id);
    }

    /// Discovers the allocators created by other participants within the registered backends.
    ///
    /// Each backend is scanned at most once; backends without allocator are skipped until one is created. On the host,
    /// the backends registered on each device are scanned as well.
    pub fn scan_backends(&self) {
        for slot in self.backends.iter() {
            let backend = match &*slot.read() {
                Some(backend) => backend.clone(),
                None => continue,
            };

            if !backend.has_allocator() || backend.is_scanned() {
                continue;
            }

            let allocator = match Allocator::shm_deserialize(backend.clone(), self.platform.thread_model()) {
                Some(allocator) => allocator,
                None => continue,
            };

            //  Another scanner won the race.
            if !backend.mark_scanned() {
                continue;
            }

            let id = allocator.id();

            match self.register_allocator_no_scan(Arc::new(allocator)) {
                Ok(()) => info!("Discovered allocator {} in {}", id, backend.id()),
                Err(error) => warn!("Could not register allocator {} of {}: {}", id, backend.id(), error),
            }
        }

        if !self.is_host() {
            return;
        }

        for device in 0..self.platform.devices().device_count() {
            let device = DeviceId::new(device as u32);

            if let Err(error) = self.scan_backends_on_device(device) {
                warn!("Could not scan the backends of {}: {}", device, error);
            }
        }
    }

    /// Registers an allocator, then scans the backends.
    ///
    /// If the default allocator is the root allocator, or has the same identifier, the allocator becomes the default.
    pub fn register_allocator(&self, allocator: Arc<Allocator>) -> Result<Arc<Allocator>> {
        self.register_allocator_no_scan(allocator.clone())?;

        {
            let mut default = self.default_allocator.write();

            if Arc::ptr_eq(&*default, &self.root_allocator) || default.id() == allocator.id() {
                *default = allocator.clone();
            }
        }

        self.scan_backends();

        Ok(allocator)
    }

    /// Registers an allocator, replacing any allocator with the same identifier.
    pub fn register_allocator_no_scan(&self, allocator: Arc<Allocator>) -> Result<()> {
        let id = allocator.id();

        *self.allocator_slot(id)?.write() = Some(allocator);

        debug!("Registered allocator {}", id);
        Ok(())
    }

    /// Unregisters an allocator, returning it.
    pub fn unregister_allocator(&self, id: AllocatorId) -> Option<Arc<Allocator>> {
        let allocator = self.allocator_slot(id).ok()?.write().take();

        if allocator.is_some() {
            debug!("Unregistered allocator {}", id);
        }

        allocator
    }

    /// Registers a backend.
    pub fn register_backend(&self, backend: Arc<Backend>) -> Result<()> {
        let id = backend.id();
        let mut slot = self.backend_slot(id)?.write();

        if slot.is_some() {
            return Err(Error::BackendExists(id));
        }

        *slot = Some(backend);

        debug!("Registered {}", id);
        Ok(())
    }

    /// Unregisters a backend, returning it.
    pub fn unregister_backend(&self, id: BackendId) -> Option<Arc<Backend>> {
        let backend = self.backend_slot(id).ok()?.write().take();

        if backend.is_some() {
            debug!("Unregistered {}", id);
        }

        backend
    }

    /// Returns the allocator registered with this identifier, if any.
    pub fn get_allocator(&self, id: AllocatorId) -> Option<Arc<Allocator>> {
        self.allocator_slot(id).ok()?.read().clone()
    }

    /// Returns the backend registered with this identifier, if any.
    pub fn get_backend(&self, id: BackendId) -> Option<Arc<Backend>> { self.backend_slot(id).ok()?.read().clone() }

    /// Returns the root allocator.
    pub fn root_allocator(&self) -> &Arc<Allocator> { &self.root_allocator }

    /// Returns the root backend.
    pub fn root_backend(&self) -> &Arc<Backend> { &self.root_backend }

    /// Returns the default allocator.
    pub fn default_allocator(&self) -> Arc<Allocator> { self.default_allocator.read().clone() }

    /// Resolves a portable pointer to an address of the current address space.
    ///
    /// Returns None if the pointer is null, or its allocator is not registered.
    pub fn convert(&self, pointer: &Pointer) -> Option<*mut u8> {
        if pointer.is_null() {
            return None;
        }

        let allocator = self.get_allocator(pointer.alloc_id())?;

        Some(allocator.convert_offset(pointer.offset()))
    }

    /// Derives the portable pointer of an address of the current address space.
    ///
    /// Returns None if no registered allocator contains the address.
    pub fn convert_raw(&self, pointer: *const u8) -> Option<Pointer> {
        self.allocators.iter().find_map(|slot| {
            let allocator = slot.read().clone()?;
            let offset = allocator.convert_ptr(pointer)?;

            Some(Pointer::new(allocator.id(), offset))
        })
    }

    /// Pushes a backend to its device: copies the content of a mirrored backend to its device-resident copy, then
    /// registers the device-resident view in the device manager.
    ///
    /// No-op if the backend is not registered, or has no device-resident view.
    pub fn copy_backend_to_device(&self, id: BackendId) -> Result<()> {
        let backend = match self.get_backend(id) {
            Some(backend) => backend,
            None => return Ok(()),
        };

        let (device, region, size) = match backend.device_view() {
            Some(view) => view,
            None => return Ok(()),
        };

        let devices = self.platform.devices();
        devices.set_device(device)?;

        if backend.is_mirrored() {
            //  Safety:
            //  -   Both the backend and its mirror are at least `size` bytes, and distinct.
            unsafe { devices.memcpy(region, backend.base(), size)? };
        }

        devices.launch(Kernel::RegisterBackend { id, kind: backend.kind(), region, size })?;
        devices.synchronize()?;

        if backend.has_device_allocator() {
            self.set_backend_has_allocator_on_device(id)?;
        }

        debug!("Copied {} to {}", id, device);
        Ok(())
    }

    /// Refreshes the device-resident copy of a mirrored backend.
    pub fn sync_mirror(&self, id: BackendId) -> Result<()> { self.copy_backend_to_device(id) }

    /// Marks the device-resident view of a backend as holding an allocator.
    pub fn set_backend_has_allocator_on_device(&self, id: BackendId) -> Result<()> {
        let device = match self.get_backend(id).and_then(|backend| backend.kind().device()) {
            Some(device) => device,
            None => return Ok(()),
        };

        let devices = self.platform.devices();
        devices.set_device(device)?;
        devices.launch(Kernel::SetBackendHasAllocator(id))?;
        devices.synchronize()
    }

    /// Scans the backends registered on `device`.
    pub fn scan_backends_on_device(&self, device: DeviceId) -> Result<()> {
        let devices = self.platform.devices();
        devices.set_device(device)?;
        devices.launch(Kernel::ScanBackends)?;
        devices.synchronize()
    }

    /// Executes a kernel within the context of this manager.
    ///
    /// Invoked by device runtimes, on the manager of the device the kernel was launched on.
    ///
    /// #   Safety
    ///
    /// -   Assumes that the region of a `RegisterBackend` kernel is valid for reads and writes of `size` bytes, for
    ///     as long as the backend remains registered.
    pub unsafe fn execute_kernel(&self, kernel: Kernel) -> Result<()> {
        match kernel {
            Kernel::RegisterBackend { id, kind, region, size } => {
                let region: Box<dyn Region> = Box::new(ArrayRegion::new(region, size));

                let backend = if Backend::is_formatted(region.as_ref()) {
                    Backend::shm_deserialize(region)?
                } else {
                    Backend::shm_init(id, kind, region)?
                };
                backend.own();

                *self.backend_slot(id)?.write() = Some(Arc::new(backend));

                debug!("Registered {} within {:?}", id, self.context);
                Ok(())
            },
            Kernel::SetBackendHasAllocator(id) => {
                if let Some(backend) = self.get_backend(id) {
                    backend.set_has_allocator();
                }

                Ok(())
            },
            Kernel::CreateAllocator { backend_id, alloc_id, custom_header_size, kind } => {
                self.create_allocator(backend_id, alloc_id, custom_header_size, kind).map(|_| ())
            },
            Kernel::ScanBackends => {
                self.scan_backends();
                Ok(())
            },
        }
    }

    fn is_host(&self) -> bool { self.context == Context::Host }

    fn check_allocator_id(id: AllocatorId) {
        if id.is_null() || id.is_root() {
            error!("An allocator cannot be created with the reserved identifier {}", id);
            panic!("An allocator cannot be created with the reserved identifier {}", id);
        }
    }

    fn backend_slot(&self, id: BackendId) -> Result<&RwLock<Option<Arc<Backend>>>> {
        self.backends.get(id.index()).ok_or(Error::BackendTableFull(id))
    }

    fn allocator_slot(&self, id: AllocatorId) -> Result<&RwLock<Option<Arc<Allocator>>>> {
        id.index(C::MINORS_PER_MAJOR)
            .and_then(|index| self.allocators.get(index))
            .ok_or(Error::AllocatorTableFull(id))
    }
}
