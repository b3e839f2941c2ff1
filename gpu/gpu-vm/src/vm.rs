//! # Address space
//!
//! A [`Vm`] owns the mapping directory and one page-table tree per tile.
//!
//! ```text
//!            ┌──────────── RwLock<VmState> ─────────────┐
//!  Vm ──────►│ VmaTree: [start,end) → Arc<Vma>          │
//!   │        │ tiles:   PageTable per tile (root kept)  │
//!   │        └──────────────────────────────────────────┘
//!   ├─ resv: Reservation (bind fences, preemption fences)
//!   ├─ userptrs: all + invalidated
//!   ├─ rebind_list: evicted / invalidated entries
//!   ├─ async_ops: FIFO + error latch ──► "vmN-bind" worker
//!   └─ preempt: compute engines     ──► "vmN-rebind" worker
//! ```
//!
//! Lock order: structural lock, then reservations in ascending id, then the
//! short inner mutexes. Workers hold `Weak<Vm>` and never keep the address
//! space alive; the last `Arc` drop hands the tree to a teardown thread.

use crate::async_queue::{self, AsyncQueue};
use crate::device::DeviceShared;
use crate::preempt::{self, PreemptState, RebindKick};
use crate::userptr;
use crate::vma::Vma;
use crate::vma_tree::VmaTree;
use crate::{VmError, VmFlags, VmResult};
use gpu_addresses::{DmaAddress, GpuAddress, VaRange};
use gpu_pgtable::{CacheLevel, PageTable, PtConfig, Translation};
use gpu_sync::{FenceUsage, Reservation};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub type VmId = u32;

pub(crate) struct VmState {
    pub(crate) vmas: VmaTree,
    pub(crate) tiles: Vec<PageTable>,
}

impl VmState {
    pub(crate) fn tile(&self, tile: u8) -> VmResult<&PageTable> {
        self.tiles
            .get(usize::from(tile))
            .ok_or(VmError::InvalidArgument("no such tile"))
    }

    pub(crate) fn tile_mut(&mut self, tile: u8) -> VmResult<&mut PageTable> {
        self.tiles
            .get_mut(usize::from(tile))
            .ok_or(VmError::InvalidArgument("no such tile"))
    }
}

#[derive(Default)]
pub(crate) struct UserptrLists {
    pub(crate) all: Vec<Weak<Vma>>,
    pub(crate) invalidated: Vec<Arc<Vma>>,
}

pub struct Vm {
    id: VmId,
    flags: VmFlags,
    pub(crate) device: Arc<DeviceShared>,
    pub(crate) resv: Arc<Reservation>,
    pub(crate) state: RwLock<VmState>,
    pub(crate) userptrs: Mutex<UserptrLists>,
    pub(crate) rebind_list: Mutex<Vec<Arc<Vma>>>,
    pub(crate) async_ops: Arc<AsyncQueue>,
    pub(crate) preempt: Mutex<PreemptState>,
    pub(crate) rebind_kick: Arc<RebindKick>,
    closed: AtomicBool,
    killed: AtomicBool,
    first_bind_done: AtomicBool,
    this: Weak<Self>,
}

impl Vm {
    pub(crate) fn create(device: &Arc<DeviceShared>, id: VmId, flags: VmFlags) -> VmResult<Arc<Self>> {
        let cfg = &device.config;
        flags.validate(cfg)?;
        let pt_config = PtConfig {
            va_bits: cfg.va_bits,
            scratch_page: flags.contains(VmFlags::SCRATCH_PAGE).then_some(cfg.scratch_page),
            huge_pages: cfg.huge_pages,
            dir_cache: CacheLevel::WriteBack,
        };
        let tiles = (0..cfg.tiles)
            .map(|_| PageTable::new(Arc::clone(&device.backends.tables), pt_config))
            .collect::<Result<Vec<_>, _>>()?;

        let vm = Arc::new_cyclic(|this| Self {
            id,
            flags,
            device: Arc::clone(device),
            resv: Arc::new(Reservation::new("vm")),
            state: RwLock::new(VmState {
                vmas: VmaTree::new(),
                tiles,
            }),
            userptrs: Mutex::new(UserptrLists::default()),
            rebind_list: Mutex::new(Vec::new()),
            async_ops: Arc::new(AsyncQueue::new()),
            preempt: Mutex::new(PreemptState::default()),
            rebind_kick: Arc::new(RebindKick::new()),
            closed: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            first_bind_done: AtomicBool::new(false),
            this: this.clone(),
        });
        device.vm_created(flags);

        if flags.contains(VmFlags::ASYNC_BIND_OPS) {
            async_queue::spawn_worker(&vm)?;
        }
        if flags.contains(VmFlags::COMPUTE_MODE) {
            preempt::spawn_rebind_worker(&vm)?;
        }
        info!(
            "vm{id}: created, flags {flags:?}, {} tiles, root {:?}",
            cfg.tiles,
            vm.state.read().tiles.first().map(PageTable::root_address)
        );
        Ok(vm)
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> VmId {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> VmFlags {
        self.flags
    }

    /// Size of the address space in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.device.config.va_size()
    }

    #[must_use]
    pub const fn is_fault_mode(&self) -> bool {
        self.flags.contains(VmFlags::FAULT_MODE)
    }

    #[must_use]
    pub const fn is_compute_mode(&self) -> bool {
        self.flags.contains(VmFlags::COMPUTE_MODE)
    }

    /// Reservation carrying bind fences and preemption fences.
    #[must_use]
    pub const fn reservation(&self) -> &Arc<Reservation> {
        &self.resv
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub(crate) fn first_bind_done(&self) -> bool {
        self.first_bind_done.load(Ordering::Acquire)
    }

    pub(crate) fn note_first_bind(&self) {
        self.first_bind_done.store(true, Ordering::Release);
    }

    pub(crate) fn arc(&self) -> Option<Arc<Self>> {
        self.this.upgrade()
    }

    pub(crate) fn weak(&self) -> Weak<Self> {
        self.this.clone()
    }

    pub(crate) fn check_open(&self) -> VmResult<()> {
        if self.is_killed() {
            Err(VmError::Killed)
        } else if self.is_closed() {
            Err(VmError::Closed)
        } else {
            Ok(())
        }
    }

    /// DMA address of the root table of `tile`, for the context descriptor.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] for a tile the device does not have.
    pub fn root_table_address(&self, tile: u8) -> VmResult<DmaAddress> {
        Ok(self.state.read().tile(tile)?.root_address())
    }

    /// Effective translation of `addr` on `tile`.
    #[must_use]
    pub fn translate(&self, tile: u8, addr: GpuAddress) -> Option<Translation> {
        self.state.read().tile(tile).ok()?.translate(addr)
    }

    /// Live page-table entries under `range` on `tile`.
    #[must_use]
    pub fn live_entries(&self, tile: u8, range: VaRange) -> usize {
        self.state.read().tile(tile).map_or(0, |pt| pt.live_entries(range))
    }

    #[must_use]
    pub fn table_count(&self, tile: u8) -> usize {
        self.state.read().tile(tile).map_or(0, PageTable::table_count)
    }

    /// Every mapping entry, in address order.
    #[must_use]
    pub fn mappings(&self) -> Vec<Arc<Vma>> {
        self.state.read().vmas.iter().cloned().collect()
    }

    /// The mapping entry containing `addr`.
    #[must_use]
    pub fn lookup(&self, addr: GpuAddress) -> Option<Arc<Vma>> {
        self.state.read().vmas.lookup(addr).cloned()
    }

    /// Whether the GPU may use the translations of `vma` right now.
    #[must_use]
    pub fn is_translation_valid(&self, vma: &Vma) -> bool {
        vma.is_bound() && !vma.is_evicted() && !(vma.is_userptr() && self.needs_repin(vma))
    }

    /// Queues `vma` for rebind after its backing moved.
    pub(crate) fn mark_evicted(&self, vma: &Arc<Vma>) {
        if vma.is_destroyed() {
            return;
        }
        vma.set_evicted(true);
        self.queue_rebind(vma);
        debug!("vm{}: {:?} evicted", self.id, vma.range());
        if self.is_compute_mode() {
            self.rebind_kick.kick();
        }
    }

    pub(crate) fn queue_rebind(&self, vma: &Arc<Vma>) {
        let mut list = self.rebind_list.lock();
        if !list.iter().any(|v| Arc::ptr_eq(v, vma)) {
            list.push(Arc::clone(vma));
        }
    }

    pub(crate) fn take_rebind_list(&self) -> Vec<Arc<Vma>> {
        let mut list = std::mem::take(&mut *self.rebind_list.lock());
        list.retain(|v| !v.is_destroyed());
        list
    }

    /// Entries waiting for a rebind.
    #[must_use]
    pub fn pending_rebinds(&self) -> usize {
        self.rebind_list.lock().iter().filter(|v| !v.is_destroyed()).count()
    }

    /// Stops all background work. Queued async operations are canceled.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let canceled = self.async_ops.shutdown();
        if canceled > 0 {
            warn!("vm{}: closed with {canceled} queued operations", self.id);
        }
        self.rebind_kick.shutdown();
        self.detach_all_engines();
        info!("vm{}: closed", self.id);
    }

    /// Marks the address space unusable after a failed rebind.
    pub(crate) fn kill(&self, err: &VmError) {
        if self.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        error!("vm{}: killed: {err}", self.id);
        for engine in self.preempt.lock().engines() {
            engine.kill();
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.close();
        self.device.vm_destroyed(self.flags);

        let id = self.id;
        let state = std::mem::replace(
            self.state.get_mut(),
            VmState {
                vmas: VmaTree::new(),
                tiles: Vec::new(),
            },
        );
        let resv = Arc::clone(&self.resv);
        let device = Arc::clone(&self.device);
        let work = move || teardown(id, state, &resv, &device);

        // A failed spawn consumes the closure; keep the work reachable so it
        // can run inline.
        let slot = Arc::new(Mutex::new(Some(work)));
        let thread_slot = Arc::clone(&slot);
        let spawned = std::thread::Builder::new()
            .name(format!("vm{id}-teardown"))
            .spawn(move || {
                if let Some(work) = thread_slot.lock().take() {
                    work();
                }
            });
        match spawned {
            Ok(handle) => self.device.push_teardown(handle),
            Err(e) => {
                warn!("vm{id}: teardown thread failed to start ({e}), tearing down inline");
                if let Some(work) = slot.lock().take() {
                    work();
                }
            }
        }
    }
}

fn teardown(id: VmId, mut state: VmState, resv: &Reservation, device: &DeviceShared) {
    if let Err(e) = resv.wait(FenceUsage::Kernel) {
        warn!("vm{id}: in-flight page-table work failed during teardown: {e}");
    }
    let mut released = 0usize;
    for vma in state.vmas.drain() {
        vma.mark_destroyed();
        vma.take_present();
        release_vma(&vma, device);
        released += 1;
    }
    let tables: usize = state.tiles.iter().map(PageTable::table_count).sum();
    drop(state);
    info!("vm{id}: torn down, {released} mappings, {tables} tables released");
}

/// Drops the entry's hold on its backing.
pub(crate) fn release_vma(vma: &Vma, device: &DeviceShared) {
    if let Some(obj) = vma.object() {
        obj.vma_links().unlink(vma);
    }
    if let Some(u) = vma.userptr() {
        userptr::release(u, device);
    }
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
