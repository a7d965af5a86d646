//! The API of shmalloc-core.

mod allocator;
mod backend;
mod configuration;
mod device;
mod error;
mod ids;
mod manager;
mod platform;
mod pointer;
mod thread_model;

pub use allocator::{Allocator, AllocatorKind};
pub use backend::{Backend, BackendKind, Mirror};
pub(crate) use backend::BACKEND_HEADER_SIZE;
pub use configuration::{Configuration, DefaultConfiguration};
pub use device::{DeviceId, DeviceRuntime, IpcMemHandle, Kernel, NoDevices};
pub use error::{Error, Result};
pub use ids::{AllocatorId, BackendId};
pub use manager::MemoryManager;
pub use platform::{ArrayRegion, DevicePlatform, Platform, Region};
pub use pointer::{FullPtr, OffsetPointer, Pointer};
pub use thread_model::{NoOpThreadModel, ThreadId, ThreadModel};
