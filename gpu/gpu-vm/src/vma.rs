//! Mapping entries.

use crate::backing::BackingHandle;
use crate::userptr::ListenerHandle;
use crate::vm::Vm;
use gpu_addresses::{DmaAddress, GpuAddress, VaRange};
use gpu_pgtable::{CacheLevel, PteAttrs};
use gpu_sync::Reservation;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// What a mapping entry translates to.
pub enum VmaBacking {
    /// A byte offset into a buffer object.
    Object { obj: BackingHandle, offset: u64 },
    /// Pinned host memory.
    Userptr(Userptr),
}

/// Host-memory backing of a mapping entry.
pub struct Userptr {
    host_addr: u64,
    pub(crate) state: Mutex<UserptrState>,
}

#[derive(Default)]
pub(crate) struct UserptrState {
    /// One DMA address per page; empty while unpinned.
    pub(crate) pages: Arc<[DmaAddress]>,
    /// Notifier sequence observed when `pages` was pinned.
    pub(crate) seq: u64,
    pub(crate) listener: Option<ListenerHandle>,
}

impl Userptr {
    pub(crate) fn new(host_addr: u64) -> Self {
        Self {
            host_addr,
            state: Mutex::new(UserptrState::default()),
        }
    }

    #[inline]
    #[must_use]
    pub const fn host_addr(&self) -> u64 {
        self.host_addr
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        !self.state.lock().pages.is_empty()
    }

    /// Pinned pages, empty while unpinned.
    #[must_use]
    pub fn pages(&self) -> Arc<[DmaAddress]> {
        Arc::clone(&self.state.lock().pages)
    }

    #[must_use]
    pub fn pinned_seq(&self) -> u64 {
        self.state.lock().seq
    }

    #[must_use]
    pub fn listener(&self) -> Option<ListenerHandle> {
        self.state.lock().listener
    }
}

/// One mapped range of an address space.
///
/// Present bits are set per tile only after the page-table commit for that
/// tile succeeded, and cleared before any teardown starts.
pub struct Vma {
    range: VaRange,
    vm: Weak<Vm>,
    backing: VmaBacking,
    read_only: bool,
    tile_mask: u8,
    tile_present: AtomicU8,
    destroyed: AtomicBool,
    evicted: AtomicBool,
}

impl Vma {
    pub(crate) fn new(vm: Weak<Vm>, range: VaRange, backing: VmaBacking, read_only: bool, tile_mask: u8) -> Self {
        Self {
            range,
            vm,
            backing,
            read_only,
            tile_mask,
            tile_present: AtomicU8::new(0),
            destroyed: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
        }
    }

    /// A fresh, unbound entry covering `sub` with the same backing at the
    /// matching offset.
    pub(crate) fn split_off(&self, sub: VaRange) -> Self {
        debug_assert!(self.range.contains(&sub));
        let delta = sub.start() - self.range.start();
        let backing = match &self.backing {
            VmaBacking::Object { obj, offset } => VmaBacking::Object {
                obj: Arc::clone(obj),
                offset: offset + delta,
            },
            VmaBacking::Userptr(u) => VmaBacking::Userptr(Userptr::new(u.host_addr + delta)),
        };
        Self::new(self.vm.clone(), sub, backing, self.read_only, self.tile_mask)
    }

    #[inline]
    #[must_use]
    pub const fn range(&self) -> VaRange {
        self.range
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> GpuAddress {
        self.range.start()
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> GpuAddress {
        self.range.end()
    }

    #[must_use]
    pub const fn backing(&self) -> &VmaBacking {
        &self.backing
    }

    #[must_use]
    pub const fn object(&self) -> Option<&BackingHandle> {
        match &self.backing {
            VmaBacking::Object { obj, .. } => Some(obj),
            VmaBacking::Userptr(_) => None,
        }
    }

    /// Byte offset into the backing object, or into the pinned pages.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        match &self.backing {
            VmaBacking::Object { offset, .. } => *offset,
            VmaBacking::Userptr(_) => 0,
        }
    }

    #[must_use]
    pub const fn userptr(&self) -> Option<&Userptr> {
        match &self.backing {
            VmaBacking::Userptr(u) => Some(u),
            VmaBacking::Object { .. } => None,
        }
    }

    #[must_use]
    pub const fn is_userptr(&self) -> bool {
        matches!(self.backing, VmaBacking::Userptr(_))
    }

    #[must_use]
    pub fn reservation(&self) -> Option<&Arc<Reservation>> {
        self.object().map(|o| o.reservation())
    }

    #[inline]
    #[must_use]
    pub const fn read_only(&self) -> bool {
        self.read_only
    }

    /// Tiles this entry is meant to be bound on.
    #[inline]
    #[must_use]
    pub const fn tile_mask(&self) -> u8 {
        self.tile_mask
    }

    /// Tiles whose page tables currently hold this entry.
    #[must_use]
    pub fn tile_present(&self) -> u8 {
        self.tile_present.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.tile_present() != 0
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Owning address space, unless it is already gone.
    #[must_use]
    pub fn vm(&self) -> Option<Arc<Vm>> {
        self.vm.upgrade()
    }

    pub(crate) fn belongs_to(&self, vm: &Vm) -> bool {
        std::ptr::eq(self.vm.as_ptr(), vm)
    }

    pub(crate) fn set_present(&self, tile: u8) {
        self.tile_present.fetch_or(1 << tile, Ordering::AcqRel);
    }

    pub(crate) fn restore_present(&self, mask: u8) {
        self.tile_present.fetch_or(mask, Ordering::AcqRel);
    }

    /// Clears every present bit, returning the previous mask.
    pub(crate) fn take_present(&self) -> u8 {
        self.tile_present.swap(0, Ordering::AcqRel)
    }

    pub(crate) fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_evicted(&self, evicted: bool) {
        self.evicted.store(evicted, Ordering::Release);
    }

    pub(crate) fn attrs(&self) -> PteAttrs {
        let local = self.object().is_some_and(|o| o.is_local_memory());
        PteAttrs::read_write()
            .with_writable(!self.read_only)
            .with_local_memory(local)
            .with_cache(CacheLevel::WriteBack)
    }
}

impl fmt::Debug for Vma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Vma");
        d.field("range", &self.range);
        match &self.backing {
            VmaBacking::Object { offset, .. } => d.field("offset", offset),
            VmaBacking::Userptr(u) => d.field("host_addr", &format_args!("{:#x}", u.host_addr)),
        };
        d.field("read_only", &self.read_only)
            .field("tile_present", &format_args!("{:#04b}", self.tile_present()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, len: u64) -> VaRange {
        VaRange::from_len(GpuAddress::new(start), len).unwrap()
    }

    #[test]
    fn split_userptr_shifts_host_address_and_starts_unpinned() {
        let v = Vma::new(Weak::new(), range(0x10000, 0x3000), VmaBacking::Userptr(Userptr::new(0x7f00_0000)), false, 1);
        v.userptr().unwrap().state.lock().pages = Arc::from(vec![DmaAddress::new(0x1000); 3]);
        let tail = v.split_off(range(0x12000, 0x1000));
        let u = tail.userptr().unwrap();
        assert_eq!(u.host_addr(), 0x7f00_2000);
        assert!(!u.is_pinned());
        assert!(!tail.is_bound());
    }

    #[test]
    fn present_bits_are_taken_once() {
        let v = Vma::new(Weak::new(), range(0, 0x1000), VmaBacking::Userptr(Userptr::new(0)), true, 0b11);
        v.set_present(0);
        v.set_present(1);
        assert_eq!(v.take_present(), 0b11);
        assert_eq!(v.take_present(), 0);
        assert!(!v.attrs().writable);
        assert!(v.mark_destroyed());
        assert!(!v.mark_destroyed());
    }
}
