//! Abstraction over OS differences.

mod emulated;

pub use emulated::EmulatedDevices;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::{ShmPlatform, ShmThreadModel};
