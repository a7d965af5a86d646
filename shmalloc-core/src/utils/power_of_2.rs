//! Alignments and size classes.

use core::{mem, num};

/// PowerOf2
///
/// An integral guaranteed to be non-zero and a power of 2, used for alignments and size classes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PowerOf2(num::NonZeroUsize);

impl PowerOf2 {
    /// The smallest PowerOf2.
    //  Safety:
    //  -   1 is a power of 2.
    pub const ONE: PowerOf2 = unsafe { PowerOf2::new_unchecked(1) };

    /// Returns `value` as a PowerOf2, if it is one.
    pub fn new(value: usize) -> Option<PowerOf2> {
        if value.count_ones() == 1 {
            //  Safety:
            //  -   A single bit is set.
            Some(unsafe { PowerOf2::new_unchecked(value) })
        } else {
            None
        }
    }

    /// Returns `value` as a PowerOf2, without checking.
    ///
    /// #   Safety
    ///
    /// Assumes that the value is a power of 2.
    pub const unsafe fn new_unchecked(value: usize) -> PowerOf2 {
        //  Safety:
        //  -   A power of 2 cannot be 0.
        PowerOf2(num::NonZeroUsize::new_unchecked(value))
    }

    /// Returns the alignment of `T`.
    pub const fn align_of<T>() -> PowerOf2 {
        //  Safety:
        //  -   Alignment is always a power of 2, and never 0.
        unsafe { PowerOf2::new_unchecked(mem::align_of::<T>()) }
    }

    /// Returns the smallest power of 2 greater than or equal to `size`, or None on overflow.
    ///
    /// A `size` of 0 yields 1.
    pub fn from_size(size: usize) -> Option<PowerOf2> {
        size.checked_next_power_of_two().and_then(PowerOf2::new)
    }

    /// Returns the value.
    pub const fn value(&self) -> usize { self.0.get() }

    /// Returns the base 2 logarithm of the value.
    pub const fn log2(&self) -> usize { self.value().trailing_zeros() as usize }

    /// Returns the smallest multiple of `self` greater than or equal to `n`.
    pub const fn round_up(&self, n: usize) -> usize {
        (n + self.mask()) & !self.mask()
    }

    /// Rounds the value up to the nearest higher multiple of `self`, or None on overflow.
    pub fn checked_round_up(&self, n: usize) -> Option<usize> {
        n.checked_add(self.mask()).map(|n| n & !self.mask())
    }

    /// Rounds the offset up to the nearest higher multiple of `self`.
    pub const fn round_up_offset(&self, n: u64) -> u64 {
        let mask = self.mask() as u64;

        (n + mask) & !mask
    }

    /// Rounds the offset up to the nearest higher multiple of `self`, or None on overflow.
    pub fn checked_round_up_offset(&self, n: u64) -> Option<u64> {
        let mask = self.mask() as u64;

        n.checked_add(mask).map(|n| n & !mask)
    }

    /// Returns the largest multiple of `self` less than or equal to `n`.
    pub const fn round_down(&self, n: usize) -> usize { n & !self.mask() }

    /// Returns whether `n` is a multiple of `self`.
    pub const fn is_aligned(&self, n: usize) -> bool { n & self.mask() == 0 }

    const fn mask(&self) -> usize { self.value() - 1 }
}
