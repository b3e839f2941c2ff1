//! # GPU Address Types
//!
//! Strongly typed wrappers for the two address spaces a GPU memory manager
//! juggles: GPU virtual addresses (what shaders and engines see) and DMA
//! addresses (what the page tables point at).
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`GpuAddress`] | A GPU virtual address, translated by the page-table tree. |
//! | [`DmaAddress`] | A device-visible physical/IO address: VRAM offset or IOMMU address of pinned system memory. |
//! | [`VaRange`] | A half-open, non-empty `[start, end)` range of GPU virtual addresses. |
//!
//! Both address types are zero-cost `u64` newtypes; mixing them up is a
//! compile error instead of a corrupted page table.
//!
//! ## Page Sizes
//!
//! The hardware layout supports three translation granules, modelled as
//! marker types implementing [`PageSize`]:
//!
//! - [`Size4K`]: 4 KiB leaf pages (base granularity)
//! - [`Size2M`]: 2 MiB huge pages, one level-1 entry
//! - [`Size1G`]: 1 GiB huge pages, one level-2 entry
//!
//! ## Typical Usage
//!
//! ```rust
//! # use gpu_addresses::*;
//! let va = GpuAddress::new(0x0000_0010_0020_1234);
//! assert_eq!(va.align_down::<Size4K>().as_u64(), 0x0000_0010_0020_1000);
//! assert_eq!(va.offset_in::<Size4K>(), 0x234);
//!
//! let range = VaRange::from_len(GpuAddress::new(0x10000), 3 * Size4K::SIZE).unwrap();
//! assert_eq!(range.end().as_u64(), 0x13000);
//! assert!(range.is_aligned::<Size4K>());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod address;
mod page_size;
mod range;

pub use address::{DmaAddress, GpuAddress};
pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use range::VaRange;

/// Align `x` down to the given power-of-two `align`.
///
/// # Examples
///
/// ```
/// # use gpu_addresses::align_down;
/// assert_eq!(align_down(0x12345, 0x1000), 0x12000);
/// assert_eq!(align_down(0x2000, 0x1000), 0x2000);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

/// Align `x` up to the given power-of-two `align`.
///
/// Saturates at the highest aligned value instead of overflowing.
///
/// # Examples
///
/// ```
/// # use gpu_addresses::align_up;
/// assert_eq!(align_up(0x12345, 0x1000), 0x13000);
/// assert_eq!(align_up(0x2000, 0x1000), 0x2000);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    match x.checked_add(align - 1) {
        Some(v) => v & !(align - 1),
        None => u64::MAX & !(align - 1),
    }
}

/// Returns `true` if `x` is a multiple of the power-of-two `align`.
#[inline]
#[must_use]
pub const fn is_aligned(x: u64, align: u64) -> bool {
    debug_assert!(align.is_power_of_two());
    x & (align - 1) == 0
}
