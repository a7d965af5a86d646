//! A collection of utilities.

mod power_of_2;
mod units;

pub use power_of_2::PowerOf2;
pub use units::{parse_latency, parse_size};

/// Returns whether `address` lies within `[base, base + len)`.
pub(crate) fn is_within(base: *const u8, len: usize, address: *const u8) -> bool {
    let (base, address) = (base as usize, address as usize);

    address >= base && address - base < len
}
