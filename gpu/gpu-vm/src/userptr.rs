//! Mappings of pinned host memory.
//!
//! A userptr entry pins its host pages when first bound and registers an
//! invalidation listener for its host range. The notifier keeps a sequence
//! number per listener; the value observed at pin time is stored with the
//! pages, and a mismatch later means the pages must be pinned again before
//! the GPU may use the mapping.
//!
//! | Mode | On invalidation |
//! |------|-----------------|
//! | fault | clear the PTEs, wait (bounded) for the TLB invalidation |
//! | other | arm and wait (unbounded) for every preemption fence |
//!
//! In every mode the entry joins the invalidated list; compute-mode address
//! spaces then kick their rebind worker.

use crate::device::DeviceShared;
use crate::vma::{Userptr, Vma};
use crate::vm::Vm;
use crate::{VmError, VmResult};
use gpu_addresses::{DmaAddress, PageSize, Size4K};
use gpu_pgtable::DmaSource;
use gpu_sync::FenceUsage;
use log::{debug, warn};
use std::ops::Range;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct PinError(pub String);

/// Pins host pages for device access.
pub trait HostMemory: Send + Sync {
    /// Pins `[host_addr, host_addr + len)` and returns one DMA address per
    /// 4 KiB page.
    ///
    /// # Errors
    /// [`PinError`] when the range is not mapped or cannot be pinned.
    fn pin_pages(&self, host_addr: u64, len: u64, writable: bool) -> Result<Vec<DmaAddress>, PinError>;

    fn unpin_pages(&self, pages: &[DmaAddress]);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ListenerHandle(pub u64);

/// Receives invalidations of a registered host range.
pub trait InvalidationListener: Send + Sync {
    fn invalidate(&self, host_range: Range<u64>);
}

/// Tracks host mappings and tells listeners when they change.
pub trait InvalidationNotifier: Send + Sync {
    fn register(&self, host_range: Range<u64>, listener: Arc<dyn InvalidationListener>) -> ListenerHandle;

    fn unregister(&self, handle: ListenerHandle);

    /// Sequence number of the listener's range; bumped on every invalidation.
    fn sequence(&self, handle: ListenerHandle) -> u64;
}

struct VmaListener {
    vma: Weak<Vma>,
}

impl InvalidationListener for VmaListener {
    fn invalidate(&self, host_range: Range<u64>) {
        let Some(vma) = self.vma.upgrade() else {
            return;
        };
        if let Some(vm) = vma.vm() {
            debug!("vm{}: host range {host_range:x?} invalidated", vm.id());
            vm.userptr_invalidated(&vma);
        }
    }
}

/// Pinned pages as an address source.
pub(crate) struct Pinned<'a>(pub(crate) &'a [DmaAddress]);

impl DmaSource for Pinned<'_> {
    fn dma_address(&self, offset: u64) -> DmaAddress {
        self.0.dma_address(offset)
    }

    fn is_contiguous(&self, offset: u64, len: u64) -> bool {
        self.0.is_contiguous(offset, len)
    }
}

/// Unregisters the listener and unpins the pages of a retired entry.
pub(crate) fn release(u: &Userptr, device: &DeviceShared) {
    let (pages, listener) = {
        let mut st = u.state.lock();
        (std::mem::take(&mut st.pages), st.listener.take())
    };
    if let Some(handle) = listener {
        device.backends.notifier.unregister(handle);
    }
    if !pages.is_empty() {
        device.backends.host.unpin_pages(&pages);
    }
}

impl Vm {
    /// Starts listening for invalidations of the entry's host range.
    pub(crate) fn register_userptr(&self, vma: &Arc<Vma>) {
        let Some(u) = vma.userptr() else {
            return;
        };
        let host = u.host_addr()..u.host_addr() + vma.range().len();
        let handle = self
            .device
            .backends
            .notifier
            .register(host, Arc::new(VmaListener { vma: Arc::downgrade(vma) }));
        u.state.lock().listener = Some(handle);

        let mut lists = self.userptrs.lock();
        lists.all.retain(|w| w.strong_count() > 0);
        lists.all.push(Arc::downgrade(vma));
    }

    pub(crate) fn forget_userptr(&self, vma: &Vma) {
        let mut lists = self.userptrs.lock();
        lists.all.retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), vma));
        lists.invalidated.retain(|v| !std::ptr::eq(Arc::as_ptr(v), vma));
    }

    /// Pins the entry's host pages and records the notifier sequence.
    pub(crate) fn pin_userptr(&self, vma: &Vma) -> VmResult<()> {
        let Some(u) = vma.userptr() else {
            return Ok(());
        };
        let handle = u
            .listener()
            .ok_or(VmError::InvalidArgument("userptr mapping without a listener"))?;
        let backends = &self.device.backends;
        let len = vma.range().len();

        // Read the sequence first: an invalidation racing with the pin then
        // shows up as a mismatch.
        let seq = backends.notifier.sequence(handle);
        let pages = backends.host.pin_pages(u.host_addr(), len, !vma.read_only())?;
        let expected = len / Size4K::SIZE;
        if u64::try_from(pages.len()).ok() != Some(expected) {
            backends.host.unpin_pages(&pages);
            return Err(PinError(format!("pinned {} of {expected} pages", pages.len())).into());
        }

        let old = {
            let mut st = u.state.lock();
            st.seq = seq;
            std::mem::replace(&mut st.pages, Arc::from(pages))
        };
        if !old.is_empty() {
            backends.host.unpin_pages(&old);
        }
        debug!("vm{}: pinned {:?} at sequence {seq}", self.id(), vma.range());
        Ok(())
    }

    /// Whether the entry's pages must be pinned again before use.
    ///
    /// Always `false` for object-backed entries.
    #[must_use]
    pub fn needs_repin(&self, vma: &Vma) -> bool {
        let Some(u) = vma.userptr() else {
            return false;
        };
        let st = u.state.lock();
        match st.listener {
            Some(handle) if !st.pages.is_empty() => self.device.backends.notifier.sequence(handle) != st.seq,
            _ => true,
        }
    }

    pub(crate) fn note_invalidated(&self, vma: &Arc<Vma>) {
        let mut lists = self.userptrs.lock();
        if !lists.invalidated.iter().any(|v| Arc::ptr_eq(v, vma)) {
            lists.invalidated.push(Arc::clone(vma));
        }
    }

    pub(crate) fn userptr_invalidated(&self, vma: &Arc<Vma>) {
        if vma.is_destroyed() || self.is_closed() || !self.first_bind_done() {
            return;
        }
        self.note_invalidated(vma);

        if self.is_fault_mode() {
            if let Err(e) = self.invalidate_vma_sync(vma) {
                warn!("vm{}: invalidating {:?} failed: {e}", self.id(), vma.range());
            }
        } else if let Err(e) = self.resv.wait(FenceUsage::Bookkeep) {
            warn!("vm{}: preemption for {:?} failed: {e}", self.id(), vma.range());
        }

        if self.is_compute_mode() {
            self.rebind_kick.kick();
        }
    }

    /// Pins every invalidated entry again and queues it for rebind.
    ///
    /// Returns how many entries were pinned.
    ///
    /// # Errors
    /// The first pin failure; entries not yet handled stay invalidated.
    pub fn userptr_pin(&self) -> VmResult<usize> {
        let pending = std::mem::take(&mut self.userptrs.lock().invalidated);
        let mut pinned = 0;
        let mut rest = pending.into_iter();
        while let Some(vma) = rest.next() {
            if vma.is_destroyed() {
                continue;
            }
            if let Err(e) = self.pin_userptr(&vma) {
                let mut lists = self.userptrs.lock();
                lists.invalidated.push(vma);
                lists.invalidated.extend(rest);
                return Err(e);
            }
            self.queue_rebind(&vma);
            pinned += 1;
        }
        Ok(pinned)
    }

    /// Fails with [`VmError::Again`] while any userptr entry is invalidated.
    ///
    /// # Errors
    /// [`VmError::Again`]; the submitter repins and retries.
    pub fn userptr_check_repin(&self) -> VmResult<()> {
        if self.invalidated_userptrs() > 0 {
            Err(VmError::Again)
        } else {
            Ok(())
        }
    }

    #[must_use]
    pub fn invalidated_userptrs(&self) -> usize {
        self.userptrs
            .lock()
            .invalidated
            .iter()
            .filter(|v| !v.is_destroyed())
            .count()
    }

    /// Live userptr entries.
    #[must_use]
    pub fn userptr_count(&self) -> usize {
        self.userptrs.lock().all.iter().filter(|w| w.strong_count() > 0).count()
    }
}
