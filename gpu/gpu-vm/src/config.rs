//! Device-wide configuration and per-address-space creation flags.

use crate::{VmError, VmResult};
use bitflags::bitflags;
use gpu_addresses::DmaAddress;
use gpu_pgtable::walk::MAX_ROOT_LEVEL;
use std::time::Duration;

/// Largest number of tiles a device may expose; tile masks are `u8`.
pub const MAX_TILES: u8 = 8;

bitflags! {
    /// Creation flags of an address space.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VmFlags: u32 {
        /// Unmapped addresses read a scratch page instead of faulting.
        const SCRATCH_PAGE = 1 << 0;
        /// Long-running contexts; memory pressure is handled by preemption.
        const COMPUTE_MODE = 1 << 1;
        /// Bind operations may be queued on the per-VM worker.
        const ASYNC_BIND_OPS = 1 << 2;
        /// The GPU recovers from page faults; binds may be deferred.
        const FAULT_MODE = 1 << 3;
    }
}

impl VmFlags {
    /// Rejects combinations the hardware cannot honour.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] naming the conflict.
    pub fn validate(self, device: &DeviceConfig) -> VmResult<()> {
        if self.contains(Self::FAULT_MODE) {
            if !device.supports_fault_mode {
                return Err(VmError::InvalidArgument("device does not support fault mode"));
            }
            if self.contains(Self::SCRATCH_PAGE) {
                return Err(VmError::InvalidArgument("fault mode excludes the scratch page"));
            }
            if self.contains(Self::COMPUTE_MODE) {
                return Err(VmError::InvalidArgument("fault mode excludes compute mode"));
            }
        }
        Ok(())
    }
}

/// Static description of the device every address space is built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Number of tiles, each with its own page-table tree.
    pub tiles: u8,
    /// Width of a GPU virtual address.
    pub va_bits: u32,
    pub supports_fault_mode: bool,
    /// Collapse aligned, contiguous ranges into 2 MiB / 1 GiB leaves.
    pub huge_pages: bool,
    /// Page empty leaves point at when [`VmFlags::SCRATCH_PAGE`] is set.
    pub scratch_page: DmaAddress,
    /// Bound on waiting for a TLB invalidation acknowledgement.
    pub tlb_timeout: Duration,
    /// Bound on waiting for rebind data movement.
    pub migrate_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            tiles: 1,
            va_bits: 48,
            supports_fault_mode: true,
            huge_pages: true,
            scratch_page: DmaAddress::zero(),
            tlb_timeout: Duration::from_millis(500),
            migrate_timeout: Duration::from_secs(5),
        }
    }
}

impl DeviceConfig {
    /// Size of every address space on this device in bytes.
    #[inline]
    #[must_use]
    pub const fn va_size(&self) -> u64 {
        1 << self.va_bits
    }

    /// Mask with one bit per tile.
    #[inline]
    #[must_use]
    pub const fn all_tiles(&self) -> u8 {
        if self.tiles >= MAX_TILES {
            u8::MAX
        } else {
            (1 << self.tiles) - 1
        }
    }

    /// Rejects layouts the page-table engine does not implement.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`].
    pub fn validate(&self) -> VmResult<()> {
        if self.tiles == 0 || self.tiles > MAX_TILES {
            return Err(VmError::InvalidArgument("tile count must be 1..=8"));
        }
        if self.va_bits < 21 || self.va_bits > 12 + 9 * (MAX_ROOT_LEVEL + 1) {
            return Err(VmError::InvalidArgument("unsupported virtual address width"));
        }
        if self.scratch_page.as_u64() & 0xFFF != 0 {
            return Err(VmError::InvalidArgument("scratch page must be page aligned"));
        }
        Ok(())
    }
}

/// Iterates the tile indices set in `mask`.
pub(crate) fn tiles_in(mask: u8) -> impl Iterator<Item = u8> {
    (0..MAX_TILES).filter(move |t| mask & (1 << t) != 0)
}
