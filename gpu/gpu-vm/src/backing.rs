//! Memory objects that back mappings, as seen from the address space.
//!
//! The allocator owns placement and migration. The address space only needs
//! to lock an object, make it resident, ask where its pages are, and learn
//! when it moved. Every object keeps a reverse list of the mapping entries
//! that point into it ([`VmaLinks`]) so a move can find them.

use crate::vma::Vma;
use crate::vm::VmId;
use gpu_addresses::DmaAddress;
use gpu_pgtable::DmaSource;
use gpu_sync::Reservation;
use log::debug;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ResidencyError(pub String);

/// A buffer object that mappings can point into.
pub trait BackingObject: Send + Sync {
    /// Size in bytes, a multiple of 4 KiB.
    fn size(&self) -> u64;

    fn reservation(&self) -> &Arc<Reservation>;

    /// Makes the object resident for use by address space `vm`.
    ///
    /// Called with the object's reservation held.
    ///
    /// # Errors
    /// [`ResidencyError`] when placement failed.
    fn validate(&self, vm: VmId) -> Result<(), ResidencyError>;

    fn is_local_memory(&self) -> bool;

    /// Device address of the byte at `offset`; only meaningful while resident.
    fn dma_address(&self, offset: u64) -> DmaAddress;

    /// Whether `[offset, offset + len)` is physically contiguous.
    fn is_contiguous(&self, offset: u64, len: u64) -> bool;

    /// Shared with other address spaces. Preemption fences are installed on
    /// external objects as well as on the address space itself.
    fn is_external(&self) -> bool {
        false
    }

    fn vma_links(&self) -> &VmaLinks;
}

pub type BackingHandle = Arc<dyn BackingObject>;

/// Reverse mapping from an object to the entries that map it.
#[derive(Default)]
pub struct VmaLinks {
    links: Mutex<Vec<Weak<Vma>>>,
}

impl VmaLinks {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            links: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn link(&self, vma: &Arc<Vma>) {
        let mut links = self.links.lock();
        links.retain(|w| w.strong_count() > 0);
        links.push(Arc::downgrade(vma));
    }

    pub(crate) fn unlink(&self, vma: &Vma) {
        self.links
            .lock()
            .retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), vma));
    }

    /// Live entries mapping the object.
    #[must_use]
    pub fn vmas(&self) -> Vec<Arc<Vma>> {
        self.links.lock().iter().filter_map(Weak::upgrade).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.links.lock().iter().filter(|w| w.strong_count() > 0).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reports that `object` changed placement.
///
/// Every entry mapping it is marked evicted and queued for rebind on its
/// address space. Compute-mode address spaces rebind from their worker;
/// the rest rebind on the next [`Vm::rebind_evicted`](crate::Vm::rebind_evicted).
pub fn notify_backing_moved(object: &dyn BackingObject) {
    let vmas = object.vma_links().vmas();
    debug!("backing object moved, {} mappings affected", vmas.len());
    for vma in vmas {
        if let Some(vm) = vma.vm() {
            vm.mark_evicted(&vma);
        }
    }
}

/// Adapts a backing object to the page-table engine's address source.
pub(crate) struct ObjectPages<'a>(pub(crate) &'a dyn BackingObject);

impl DmaSource for ObjectPages<'_> {
    fn dma_address(&self, offset: u64) -> DmaAddress {
        self.0.dma_address(offset)
    }

    fn is_contiguous(&self, offset: u64, len: u64) -> bool {
        self.0.is_contiguous(offset, len)
    }
}
