//! Software device.
//!
//! In-memory implementations of every collaborator trait, with knobs to
//! provoke the failures the address space has to survive:
//!
//! | Type | Implements | Knobs |
//! |------|------------|-------|
//! | [`SimBuffer`] | [`BackingObject`] | placement failure, migration |
//! | [`SimSubmitter`] | [`PtSubmitter`] | deferred completion, submission failure |
//! | [`SimTlb`] | [`TlbInvalidator`] | unresponsive hardware |
//! | [`SimHostMemory`] | [`HostMemory`], [`InvalidationNotifier`] | pin failure, invalidation |
//! | [`SimComputeEngine`] | [`ComputeEngine`] | suspend and resume counts |

use crate::backing::{BackingObject, ResidencyError, VmaLinks, notify_backing_moved};
use crate::device::DeviceBackends;
use crate::hw::{PtSubmitter, SubmitError, TlbInvalidator};
use crate::preempt::ComputeEngine;
use crate::userptr::{HostMemory, InvalidationListener, InvalidationNotifier, ListenerHandle, PinError};
use crate::vm::VmId;
use gpu_addresses::{DmaAddress, VaRange};
use gpu_pgtable::{BumpTableAllocator, PtWrite};
use gpu_sync::{Fence, FenceError, FenceUsage, Reservation};
use log::trace;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

const PAGE: u64 = 4096;

/// Device window the page-table pages of [`SimBackends`] come from.
pub const TABLE_WINDOW: Range<u64> = 0x1_0000_0000..0x2_0000_0000;

/// Base of the DMA addresses handed out for pinned host pages.
pub const HOST_DMA_BASE: u64 = 0x80_0000_0000;

/// A buffer object living at a movable, contiguous device address.
pub struct SimBuffer {
    size: u64,
    base: AtomicU64,
    local: bool,
    external: bool,
    resv: Arc<Reservation>,
    links: VmaLinks,
    fail_validate: AtomicBool,
    validations: AtomicUsize,
}

impl SimBuffer {
    #[must_use]
    pub fn new(size: u64, base: DmaAddress) -> Self {
        Self {
            size,
            base: AtomicU64::new(base.as_u64()),
            local: false,
            external: false,
            resv: Arc::new(Reservation::new("sim-buffer")),
            links: VmaLinks::new(),
            fail_validate: AtomicBool::new(false),
            validations: AtomicUsize::new(0),
        }
    }

    /// Placed in device-local memory.
    #[must_use]
    pub const fn local(mut self) -> Self {
        self.local = true;
        self
    }

    /// Shared with other address spaces.
    #[must_use]
    pub const fn external(mut self) -> Self {
        self.external = true;
        self
    }

    #[must_use]
    pub fn base(&self) -> DmaAddress {
        DmaAddress::new(self.base.load(Ordering::Acquire))
    }

    pub fn set_fail_validate(&self, fail: bool) {
        self.fail_validate.store(fail, Ordering::Release);
    }

    #[must_use]
    pub fn validations(&self) -> usize {
        self.validations.load(Ordering::Acquire)
    }

    /// Moves the buffer to `new_base`.
    ///
    /// Waits for every user first, which preempts compute engines, then
    /// reports the move to the address spaces mapping it.
    ///
    /// # Errors
    /// A failed fence among the users.
    pub fn migrate(&self, new_base: DmaAddress) -> Result<(), FenceError> {
        self.resv.wait(FenceUsage::Bookkeep)?;
        self.base.store(new_base.as_u64(), Ordering::Release);
        trace!("sim buffer moved to {new_base:?}");
        notify_backing_moved(self);
        Ok(())
    }
}

impl BackingObject for SimBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn reservation(&self) -> &Arc<Reservation> {
        &self.resv
    }

    fn validate(&self, _vm: VmId) -> Result<(), ResidencyError> {
        if self.fail_validate.load(Ordering::Acquire) {
            return Err(ResidencyError("simulated placement failure".into()));
        }
        self.validations.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn is_local_memory(&self) -> bool {
        self.local
    }

    fn dma_address(&self, offset: u64) -> DmaAddress {
        self.base() + offset
    }

    fn is_contiguous(&self, _offset: u64, _len: u64) -> bool {
        true
    }

    fn is_external(&self) -> bool {
        self.external
    }

    fn vma_links(&self) -> &VmaLinks {
        &self.links
    }
}

/// Page-table job queue that either completes jobs at once or holds them
/// until [`complete_all`](Self::complete_all).
#[derive(Default)]
pub struct SimSubmitter {
    deferred: AtomicBool,
    fail: AtomicBool,
    held: Mutex<Vec<Fence>>,
    jobs: AtomicUsize,
    entries: AtomicUsize,
}

impl SimSubmitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_deferred(&self, deferred: bool) {
        self.deferred.store(deferred, Ordering::Release);
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }

    /// Completes every held job; returns how many there were.
    pub fn complete_all(&self) -> usize {
        let held = std::mem::take(&mut *self.held.lock());
        for f in &held {
            f.signal();
        }
        held.len()
    }

    #[must_use]
    pub fn jobs(&self) -> usize {
        self.jobs.load(Ordering::Acquire)
    }

    /// Entries written by all jobs so far.
    #[must_use]
    pub fn entries_written(&self) -> usize {
        self.entries.load(Ordering::Acquire)
    }
}

impl PtSubmitter for SimSubmitter {
    fn submit(&self, tile: u8, writes: Vec<PtWrite>) -> Result<Fence, SubmitError> {
        if self.fail.load(Ordering::Acquire) {
            return Err(SubmitError("simulated ring full".into()));
        }
        let n: usize = writes.iter().map(|w| w.values.len()).sum();
        self.jobs.fetch_add(1, Ordering::AcqRel);
        self.entries.fetch_add(n, Ordering::AcqRel);
        trace!("sim tile {tile}: job with {} writes, {n} entries", writes.len());
        if self.deferred.load(Ordering::Acquire) {
            let f = Fence::new();
            self.held.lock().push(f.clone());
            Ok(f)
        } else {
            Ok(Fence::signaled())
        }
    }
}

/// TLB that acknowledges invalidations at once, or holds them while
/// unresponsive.
pub struct SimTlb {
    responsive: AtomicBool,
    log: Mutex<Vec<(u8, VaRange)>>,
    unacked: Mutex<Vec<Fence>>,
}

impl Default for SimTlb {
    fn default() -> Self {
        Self {
            responsive: AtomicBool::new(true),
            log: Mutex::new(Vec::new()),
            unacked: Mutex::new(Vec::new()),
        }
    }
}

impl SimTlb {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Becoming responsive acknowledges everything held so far.
    pub fn set_responsive(&self, responsive: bool) {
        self.responsive.store(responsive, Ordering::Release);
        if responsive {
            for f in std::mem::take(&mut *self.unacked.lock()) {
                f.signal();
            }
        }
    }

    /// Invalidations issued so far, in order.
    #[must_use]
    pub fn invalidations(&self) -> Vec<(u8, VaRange)> {
        self.log.lock().clone()
    }
}

impl TlbInvalidator for SimTlb {
    fn invalidate(&self, tile: u8, range: VaRange) -> Fence {
        self.log.lock().push((tile, range));
        if self.responsive.load(Ordering::Acquire) {
            Fence::signaled()
        } else {
            let f = Fence::new();
            self.unacked.lock().push(f.clone());
            f
        }
    }
}

struct Listener {
    range: Range<u64>,
    seq: u64,
    target: Arc<dyn InvalidationListener>,
}

#[derive(Default)]
struct HostState {
    listeners: HashMap<u64, Listener>,
    next: u64,
    generation: u64,
    pinned: usize,
    fail_pin: bool,
}

/// Host address space with pinning and invalidation notifications.
///
/// Every invalidation moves the host pages: pins taken afterwards return
/// different DMA addresses.
#[derive(Default)]
pub struct SimHostMemory {
    state: Mutex<HostState>,
}

impl SimHostMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_pin(&self, fail: bool) {
        self.state.lock().fail_pin = fail;
    }

    #[must_use]
    pub fn pinned_pages(&self) -> usize {
        self.state.lock().pinned
    }

    #[must_use]
    pub fn listeners(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// DMA address a pin of `host_addr` would return right now.
    #[must_use]
    pub fn dma_for(&self, host_addr: u64) -> DmaAddress {
        Self::dma(self.state.lock().generation, host_addr)
    }

    fn dma(generation: u64, host_addr: u64) -> DmaAddress {
        DmaAddress::new(HOST_DMA_BASE + (generation << 36) + (host_addr & ((1 << 36) - 1)))
    }

    /// Unmaps and remaps `range` on the host; returns how many listeners
    /// were told.
    pub fn invalidate(&self, range: Range<u64>) -> usize {
        let targets: Vec<_> = {
            let mut st = self.state.lock();
            st.generation += 1;
            st.listeners
                .values_mut()
                .filter(|l| l.range.start < range.end && range.start < l.range.end)
                .map(|l| {
                    l.seq += 1;
                    (Arc::clone(&l.target), l.range.clone())
                })
                .collect()
        };
        for (target, r) in &targets {
            target.invalidate(r.clone());
        }
        targets.len()
    }
}

impl HostMemory for SimHostMemory {
    fn pin_pages(&self, host_addr: u64, len: u64, _writable: bool) -> Result<Vec<DmaAddress>, PinError> {
        let mut st = self.state.lock();
        if st.fail_pin {
            return Err(PinError(format!("host range {host_addr:#x}+{len:#x} is not mapped")));
        }
        let pages: Vec<_> = (0..len / PAGE)
            .map(|i| Self::dma(st.generation, host_addr + i * PAGE))
            .collect();
        st.pinned += pages.len();
        Ok(pages)
    }

    fn unpin_pages(&self, pages: &[DmaAddress]) {
        let mut st = self.state.lock();
        st.pinned = st.pinned.saturating_sub(pages.len());
    }
}

impl InvalidationNotifier for SimHostMemory {
    fn register(&self, host_range: Range<u64>, listener: Arc<dyn InvalidationListener>) -> ListenerHandle {
        let mut st = self.state.lock();
        st.next += 1;
        let id = st.next;
        st.listeners.insert(
            id,
            Listener {
                range: host_range,
                seq: 0,
                target: listener,
            },
        );
        ListenerHandle(id)
    }

    fn unregister(&self, handle: ListenerHandle) {
        self.state.lock().listeners.remove(&handle.0);
    }

    fn sequence(&self, handle: ListenerHandle) -> u64 {
        self.state.lock().listeners.get(&handle.0).map_or(0, |l| l.seq)
    }
}

/// Compute engine that suspends instantly and counts what happened to it.
pub struct SimComputeEngine {
    id: u64,
    running: AtomicBool,
    killed: AtomicBool,
    suspends: AtomicUsize,
    resumes: AtomicUsize,
}

impl SimComputeEngine {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            running: AtomicBool::new(true),
            killed: AtomicBool::new(false),
            suspends: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn suspends(&self) -> usize {
        self.suspends.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::Acquire)
    }
}

impl ComputeEngine for SimComputeEngine {
    fn id(&self) -> u64 {
        self.id
    }

    fn suspend(&self) -> Fence {
        self.running.store(false, Ordering::Release);
        self.suspends.fetch_add(1, Ordering::AcqRel);
        Fence::signaled()
    }

    fn resume(&self) {
        if !self.is_killed() {
            self.running.store(true, Ordering::Release);
        }
        self.resumes.fetch_add(1, Ordering::AcqRel);
    }

    fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
    }
}

/// One of each simulated backend, kept typed for inspection.
pub struct SimBackends {
    pub tables: Arc<BumpTableAllocator>,
    pub submitter: Arc<SimSubmitter>,
    pub tlb: Arc<SimTlb>,
    pub host: Arc<SimHostMemory>,
}

impl Default for SimBackends {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBackends {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Arc::new(BumpTableAllocator::new(
                DmaAddress::new(TABLE_WINDOW.start),
                DmaAddress::new(TABLE_WINDOW.end),
            )),
            submitter: Arc::new(SimSubmitter::new()),
            tlb: Arc::new(SimTlb::new()),
            host: Arc::new(SimHostMemory::new()),
        }
    }

    /// Type-erased handles for [`GpuDevice::new`](crate::GpuDevice::new).
    #[must_use]
    pub fn backends(&self) -> DeviceBackends {
        DeviceBackends {
            tables: self.tables.clone(),
            submitter: self.submitter.clone(),
            tlb: self.tlb.clone(),
            host: self.host.clone(),
            notifier: self.host.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Count(AtomicUsize);

    impl InvalidationListener for Count {
        fn invalidate(&self, _host_range: Range<u64>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn invalidation_moves_pages_and_bumps_sequence() {
        let host = SimHostMemory::new();
        let heard = Arc::new(Count(AtomicUsize::new(0)));
        let h = host.register(0x1000..0x3000, heard.clone());
        let before = host.pin_pages(0x1000, 0x2000, true).unwrap();
        assert_eq!(host.sequence(h), 0);

        assert_eq!(host.invalidate(0x5000..0x6000), 0);
        assert_eq!(host.invalidate(0x2000..0x2001), 1);
        assert_eq!(heard.0.load(Ordering::SeqCst), 1);
        assert_eq!(host.sequence(h), 1);

        let after = host.pin_pages(0x1000, 0x2000, true).unwrap();
        assert_ne!(before, after);
        assert_eq!(host.pinned_pages(), 4);
        host.unpin_pages(&before);
        assert_eq!(host.pinned_pages(), 2);

        host.unregister(h);
        assert_eq!(host.listeners(), 0);
    }

    #[test]
    fn unresponsive_tlb_acknowledges_when_it_recovers() {
        let tlb = SimTlb::new();
        let r = VaRange::from_len(gpu_addresses::GpuAddress::new(0), 0x1000).unwrap();
        tlb.set_responsive(false);
        let f = tlb.invalidate(0, r);
        assert!(!f.is_signaled());
        tlb.set_responsive(true);
        assert!(f.is_signaled());
        assert_eq!(tlb.invalidations().len(), 1);
    }

    #[test]
    fn deferred_jobs_complete_together() {
        let sub = SimSubmitter::new();
        sub.set_deferred(true);
        let a = sub.submit(0, Vec::new()).unwrap();
        let b = sub.submit(1, Vec::new()).unwrap();
        assert!(!a.is_signaled() && !b.is_signaled());
        assert_eq!(sub.complete_all(), 2);
        assert!(a.is_signaled() && b.is_signaled());
        assert_eq!(sub.jobs(), 2);
    }
}
