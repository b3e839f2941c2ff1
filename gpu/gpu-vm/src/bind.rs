//! # Bind pipeline
//!
//! Every request is validated synchronously, then planned into a chain of
//! steps under the structural write lock:
//!
//! | Request | Chain |
//! |---------|-------|
//! | map / map-userptr | `Bind(new)` |
//! | unmap | `Unbind(hit)…, Rebind(prefix)?, Rebind(suffix)?` |
//! | unmap-all | `Unbind(entry)…` for every entry of the object |
//!
//! Wait fences are consumed before the first step and signal fences follow
//! the fence of the whole chain. Each step locks the address-space
//! reservation plus the object's, validates, prepares every tile before
//! committing any, submits the writes and publishes the job fence with
//! [`FenceUsage::Kernel`] before unlocking. Unbinds clear present bits
//! first and add a TLB invalidation per tile.
//!
//! A failed unbind does not stop the chain: later unbinds still run so no
//! stale translation survives. Remainder rebinds after a failure are queued
//! on the rebind list instead.

use crate::async_queue::AsyncOp;
use crate::backing::{BackingHandle, ObjectPages};
use crate::config::tiles_in;
use crate::userptr::Pinned;
use crate::vm::{Vm, VmState, release_vma};
use crate::vma::{Userptr, Vma, VmaBacking};
use crate::{VmError, VmFlags, VmResult};
use bitflags::bitflags;
use gpu_addresses::{GpuAddress, VaRange, is_aligned};
use gpu_pgtable::DmaSource;
use gpu_sync::{AcquireContext, Fence, FenceArray, FenceError, FenceUsage, Reservation};
use log::{debug, error, warn};
use std::fmt;
use std::sync::Arc;

const PAGE: u64 = 4096;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BindFlags: u32 {
        /// Map without write permission.
        const READ_ONLY = 1 << 0;
        /// Queue on the address-space worker instead of running inline.
        const ASYNC = 1 << 1;
        /// Populate page tables now even in fault mode.
        const IMMEDIATE = 1 << 2;
    }
}

#[derive(Clone)]
pub enum BindOp {
    Map {
        obj: BackingHandle,
        offset: u64,
        addr: u64,
        range: u64,
    },
    Unmap {
        addr: u64,
        range: u64,
    },
    /// Every mapping of `obj` in this address space.
    UnmapAll {
        obj: BackingHandle,
    },
    MapUserptr {
        host_addr: u64,
        addr: u64,
        range: u64,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BindOpKind {
    Map,
    Unmap,
    UnmapAll,
    MapUserptr,
}

impl BindOp {
    #[must_use]
    pub const fn kind(&self) -> BindOpKind {
        match self {
            Self::Map { .. } => BindOpKind::Map,
            Self::Unmap { .. } => BindOpKind::Unmap,
            Self::UnmapAll { .. } => BindOpKind::UnmapAll,
            Self::MapUserptr { .. } => BindOpKind::MapUserptr,
        }
    }

    /// Start of the affected range; zero for unmap-all.
    #[must_use]
    pub const fn addr(&self) -> u64 {
        match self {
            Self::Map { addr, .. } | Self::Unmap { addr, .. } | Self::MapUserptr { addr, .. } => *addr,
            Self::UnmapAll { .. } => 0,
        }
    }

    /// Length of the affected range; zero for unmap-all.
    #[must_use]
    pub const fn range(&self) -> u64 {
        match self {
            Self::Map { range, .. } | Self::Unmap { range, .. } | Self::MapUserptr { range, .. } => *range,
            Self::UnmapAll { .. } => 0,
        }
    }
}

impl fmt::Debug for BindOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Map { offset, addr, range, .. } => {
                write!(f, "Map({addr:#x}+{range:#x} @ {offset:#x})")
            }
            Self::Unmap { addr, range } => write!(f, "Unmap({addr:#x}+{range:#x})"),
            Self::UnmapAll { obj } => write!(f, "UnmapAll({})", obj.reservation().id()),
            Self::MapUserptr { host_addr, addr, range } => {
                write!(f, "MapUserptr({addr:#x}+{range:#x} <- {host_addr:#x})")
            }
        }
    }
}

/// One operation of a bind batch.
#[derive(Clone, Debug)]
pub struct BindRequest {
    pub op: BindOp,
    pub flags: BindFlags,
    /// Tiles to bind on; zero means every tile.
    pub tile_mask: u8,
}

impl BindRequest {
    #[must_use]
    pub fn map(obj: BackingHandle, offset: u64, addr: u64, range: u64) -> Self {
        Self::from_op(BindOp::Map { obj, offset, addr, range })
    }

    #[must_use]
    pub const fn unmap(addr: u64, range: u64) -> Self {
        Self::from_op(BindOp::Unmap { addr, range })
    }

    #[must_use]
    pub const fn unmap_all(obj: BackingHandle) -> Self {
        Self::from_op(BindOp::UnmapAll { obj })
    }

    #[must_use]
    pub const fn map_userptr(host_addr: u64, addr: u64, range: u64) -> Self {
        Self::from_op(BindOp::MapUserptr { host_addr, addr, range })
    }

    const fn from_op(op: BindOp) -> Self {
        Self {
            op,
            flags: BindFlags::empty(),
            tile_mask: 0,
        }
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: BindFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn with_tiles(mut self, mask: u8) -> Self {
        self.tile_mask = mask;
        self
    }
}

/// Fences a batch waits on before starting and signals when done.
#[derive(Clone, Debug, Default)]
pub struct BindSyncs {
    pub wait: Vec<Fence>,
    pub signal: Vec<Fence>,
}

impl BindSyncs {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            wait: Vec::new(),
            signal: Vec::new(),
        }
    }

    #[must_use]
    pub fn wait_on(mut self, fence: Fence) -> Self {
        self.wait.push(fence);
        self
    }

    #[must_use]
    pub fn signal_to(mut self, fence: Fence) -> Self {
        self.signal.push(fence);
        self
    }
}

#[derive(Debug, Clone)]
pub enum BindOutcome {
    /// Ran inline; the fence signals when the GPU sees the change.
    Complete(Fence),
    /// Queued on the address-space worker.
    Queued,
}

impl BindOutcome {
    #[must_use]
    pub const fn fence(&self) -> Option<&Fence> {
        match self {
            Self::Complete(f) => Some(f),
            Self::Queued => None,
        }
    }
}

enum Step {
    /// New entry; inserted into the tree before binding, removed on failure.
    Bind { vma: Arc<Vma>, immediate: bool },
    /// Entry already out of the tree; clear its translations.
    Unbind(Arc<Vma>),
    /// Remainder already in the tree; give it translations.
    Rebind { vma: Arc<Vma>, immediate: bool },
}

pub(crate) fn signal_outputs(fence: &Fence, outs: &[Fence]) {
    for out in outs {
        out.follow(fence);
    }
}

pub(crate) fn signal_failure(outs: &[Fence], err: &VmError) {
    for out in outs {
        out.signal_error(err.clone().into());
    }
}

impl Vm {
    /// Runs one request inline.
    ///
    /// # Errors
    /// Validation errors, residency and pin failures, page-table allocation
    /// failure. The signal fences carry the error as well.
    pub fn bind(&self, req: BindRequest, syncs: BindSyncs) -> VmResult<Fence> {
        if req.flags.contains(BindFlags::ASYNC) {
            return Err(VmError::InvalidArgument("queued requests go through bind_async"));
        }
        let tiles = self.check_request(&req)?;
        match self.execute(&req, tiles, &syncs.wait) {
            Ok(fence) => {
                signal_outputs(&fence, &syncs.signal);
                Ok(fence)
            }
            Err(e) => {
                signal_failure(&syncs.signal, &e);
                Err(e)
            }
        }
    }

    /// Validates one request and queues it on the address-space worker.
    ///
    /// # Errors
    /// Validation errors, or [`VmError::Closed`].
    pub fn bind_async(&self, mut req: BindRequest, syncs: BindSyncs) -> VmResult<()> {
        req.flags |= BindFlags::ASYNC;
        let tiles = self.check_request(&req)?;
        let outs = syncs.signal.clone();
        self.async_ops.push(AsyncOp::new(req, tiles, syncs)).inspect_err(|e| signal_failure(&outs, e))
    }

    /// Unmaps `[addr, addr + range)` inline.
    ///
    /// # Errors
    /// As [`bind`](Self::bind).
    pub fn unbind(&self, addr: u64, range: u64) -> VmResult<Fence> {
        self.bind(BindRequest::unmap(addr, range), BindSyncs::new())
    }

    /// Runs a batch. All requests must agree on [`BindFlags::ASYNC`]; the
    /// first consumes the wait fences and the last produces the signal fences.
    ///
    /// # Errors
    /// Validation errors for any request reject the whole batch before
    /// anything runs. Inline execution stops at the first failure; a queued
    /// batch fails its signal fences and skips its remaining members.
    pub fn submit(&self, reqs: Vec<BindRequest>, syncs: BindSyncs) -> VmResult<BindOutcome> {
        let Some(first) = reqs.first() else {
            return Err(VmError::InvalidArgument("empty bind batch"));
        };
        let queued = first.flags.contains(BindFlags::ASYNC);
        if reqs.iter().any(|r| r.flags.contains(BindFlags::ASYNC) != queued) {
            return Err(VmError::InvalidArgument("batch mixes queued and inline requests"));
        }
        let tiles = reqs
            .iter()
            .map(|r| self.check_request(r))
            .collect::<VmResult<Vec<_>>>()?;

        let BindSyncs { wait, signal } = syncs;
        if queued {
            let outs = signal.clone();
            let ops = AsyncOp::batch(reqs.into_iter().zip(tiles).collect(), wait, signal);
            if let Err(e) = self.async_ops.push_batch(ops) {
                signal_failure(&outs, &e);
                return Err(e);
            }
            return Ok(BindOutcome::Queued);
        }

        let mut fences = FenceArray::new();
        for (i, (req, tiles)) in reqs.iter().zip(tiles).enumerate() {
            let wait = if i == 0 { &wait[..] } else { &[] };
            match self.execute(req, tiles, wait) {
                Ok(f) => fences.push(f),
                Err(e) => {
                    signal_failure(&signal, &e);
                    return Err(e);
                }
            }
        }
        let fence = fences.into_fence();
        signal_outputs(&fence, &signal);
        Ok(BindOutcome::Complete(fence))
    }

    fn check_range(&self, addr: u64, len: u64) -> VmResult<VaRange> {
        if len == 0 {
            return Err(VmError::InvalidArgument("zero-sized range"));
        }
        if !is_aligned(addr, PAGE) || !is_aligned(len, PAGE) {
            return Err(VmError::Unaligned { addr, len });
        }
        addr.checked_add(len)
            .filter(|&end| end <= self.size())
            .and_then(|end| VaRange::new(GpuAddress::new(addr), GpuAddress::new(end)))
            .ok_or(VmError::OutOfBounds { addr, len })
    }

    /// Structural validation; returns the resolved tile mask.
    pub(crate) fn check_request(&self, req: &BindRequest) -> VmResult<u8> {
        self.check_open()?;
        let all = self.device.config.all_tiles();
        let tiles = if req.tile_mask == 0 { all } else { req.tile_mask };
        if tiles & !all != 0 {
            return Err(VmError::InvalidArgument("tile mask names a missing tile"));
        }
        if req.flags.contains(BindFlags::ASYNC) && !self.flags().contains(VmFlags::ASYNC_BIND_OPS) {
            return Err(VmError::InvalidArgument("address space has no async bind queue"));
        }

        match &req.op {
            BindOp::Map { obj, offset, addr, range } => {
                let r = self.check_range(*addr, *range)?;
                if !is_aligned(*offset, PAGE) {
                    return Err(VmError::Unaligned {
                        addr: *offset,
                        len: *range,
                    });
                }
                if offset.checked_add(*range).is_none_or(|end| end > obj.size()) {
                    return Err(VmError::InvalidArgument("range exceeds the backing object"));
                }
                self.check_free(r)?;
            }
            BindOp::MapUserptr { host_addr, addr, range } => {
                let r = self.check_range(*addr, *range)?;
                if !is_aligned(*host_addr, PAGE) {
                    return Err(VmError::Unaligned {
                        addr: *host_addr,
                        len: *range,
                    });
                }
                self.check_free(r)?;
            }
            BindOp::Unmap { addr, range } => {
                self.check_range(*addr, *range)?;
            }
            BindOp::UnmapAll { .. } => {}
        }
        Ok(tiles)
    }

    /// Inline maps must not overlap; queued ones are checked again when run.
    fn check_free(&self, range: VaRange) -> VmResult<()> {
        if self.state.read().vmas.find_overlap(range).is_some() {
            return Err(VmError::overlap(range));
        }
        Ok(())
    }

    /// Plans and runs one validated request.
    pub(crate) fn execute(&self, req: &BindRequest, tiles: u8, wait: &[Fence]) -> VmResult<Fence> {
        for fence in wait {
            fence.wait()?;
        }
        self.check_open()?;
        let mut state = self.state.write();
        let steps = self.plan(&mut state, req, tiles)?;
        debug!("vm{}: {:?} as {} steps", self.id(), req.op, steps.len());
        self.run_chain(&mut state, steps)
    }

    fn plan(&self, state: &mut VmState, req: &BindRequest, tiles: u8) -> VmResult<Vec<Step>> {
        let read_only = req.flags.contains(BindFlags::READ_ONLY);
        let immediate = !self.is_fault_mode() || req.flags.contains(BindFlags::IMMEDIATE);
        let new_entry = |range: VaRange, backing: VmaBacking| -> VmResult<Vec<Step>> {
            if state.vmas.find_overlap(range).is_some() {
                return Err(VmError::overlap(range));
            }
            let vma = Arc::new(Vma::new(self.weak(), range, backing, read_only, tiles));
            Ok(vec![Step::Bind { vma, immediate }])
        };

        match &req.op {
            BindOp::Map { obj, offset, addr, range } => new_entry(
                self.check_range(*addr, *range)?,
                VmaBacking::Object {
                    obj: Arc::clone(obj),
                    offset: *offset,
                },
            ),
            BindOp::MapUserptr { host_addr, addr, range } => new_entry(
                self.check_range(*addr, *range)?,
                VmaBacking::Userptr(Userptr::new(*host_addr)),
            ),
            BindOp::Unmap { addr, range } => {
                let r = self.check_range(*addr, *range)?;
                let mut rebinds = Vec::new();
                let res = state.vmas.resolve_unmap(r, |orig, sub| {
                    let rem = Arc::new(orig.split_off(sub));
                    rebinds.push((Arc::clone(&rem), !self.is_fault_mode() || orig.is_bound()));
                    rem
                });
                for (rem, _) in &rebinds {
                    self.adopt(rem);
                }
                let mut steps: Vec<Step> = res.removed.into_iter().map(Step::Unbind).collect();
                steps.extend(rebinds.into_iter().map(|(vma, immediate)| Step::Rebind { vma, immediate }));
                Ok(steps)
            }
            BindOp::UnmapAll { obj } => {
                let mut steps = Vec::new();
                for vma in obj.vma_links().vmas() {
                    if vma.belongs_to(self) && state.vmas.remove(&vma).is_some() {
                        vma.mark_destroyed();
                        steps.push(Step::Unbind(vma));
                    }
                }
                Ok(steps)
            }
        }
    }

    /// Links a new tree entry to its backing.
    fn adopt(&self, vma: &Arc<Vma>) {
        if let Some(obj) = vma.object() {
            obj.vma_links().link(vma);
        }
        self.register_userptr(vma);
    }

    /// Detaches a removed entry; pinned pages go once `fence` signals.
    fn retire(&self, vma: &Arc<Vma>, fence: &Fence) {
        if let Some(obj) = vma.object() {
            obj.vma_links().unlink(vma);
        }
        if vma.is_userptr() {
            self.forget_userptr(vma);
            let device = Arc::clone(&self.device);
            let vma = Arc::clone(vma);
            fence.add_callback(move |_| release_vma(&vma, &device));
        }
    }

    fn run_chain(&self, state: &mut VmState, steps: Vec<Step>) -> VmResult<Fence> {
        let mut ctx = AcquireContext::new();
        let mut fences = FenceArray::new();
        let mut failure: Option<VmError> = None;

        for step in steps {
            match step {
                Step::Unbind(vma) => {
                    // Out of the tree already; retires unless a tile still translates.
                    let (fence, result) = self.clear_tiles(state, &mut ctx, &vma);
                    if vma.is_bound() {
                        error!(
                            "vm{}: {:?} still translates on tiles {:#b}, keeping its pages",
                            self.id(),
                            vma.range(),
                            vma.tile_present()
                        );
                    } else {
                        self.retire(&vma, &fence);
                    }
                    fences.push(fence);
                    if let Err(e) = result {
                        error!("vm{}: unbinding {:?} failed: {e}", self.id(), vma.range());
                        failure.get_or_insert(e);
                    }
                }
                Step::Bind { vma, immediate } => {
                    if failure.is_some() {
                        continue;
                    }
                    state.vmas.insert(Arc::clone(&vma))?;
                    self.adopt(&vma);
                    match self.bind_vma(state, &mut ctx, &vma, immediate) {
                        Ok(fence) => fences.push(fence),
                        Err(e) => {
                            state.vmas.remove(&vma);
                            vma.mark_destroyed();
                            self.forget_userptr(&vma);
                            release_vma(&vma, &self.device);
                            failure = Some(e);
                        }
                    }
                }
                Step::Rebind { vma, immediate } => {
                    if failure.is_some() {
                        self.queue_rebind(&vma);
                        continue;
                    }
                    match self.bind_vma(state, &mut ctx, &vma, immediate) {
                        Ok(fence) => fences.push(fence),
                        Err(e) => {
                            error!("vm{}: rebinding remainder {:?} failed: {e}", self.id(), vma.range());
                            self.queue_rebind(&vma);
                            failure = Some(e);
                        }
                    }
                }
            }
        }
        drop(ctx);
        match failure {
            Some(e) => Err(e),
            None => Ok(fences.into_fence()),
        }
    }

    fn lock_for(&self, ctx: &mut AcquireContext, vma: &Vma) {
        let resvs: Vec<&Arc<Reservation>> = std::iter::once(&self.resv).chain(vma.reservation()).collect();
        ctx.lock_all(resvs);
    }

    fn publish(&self, ctx: &AcquireContext, vma: &Vma, fence: &Fence) {
        self.resv.add_fence(ctx, fence.clone(), FenceUsage::Kernel);
        if let Some(resv) = vma.reservation() {
            resv.add_fence(ctx, fence.clone(), FenceUsage::Kernel);
        }
    }

    /// Builds the entry's translations on every requested tile.
    pub(crate) fn bind_vma(
        &self,
        state: &mut VmState,
        ctx: &mut AcquireContext,
        vma: &Arc<Vma>,
        immediate: bool,
    ) -> VmResult<Fence> {
        if !immediate {
            debug!("vm{}: {:?} left to the fault handler", self.id(), vma.range());
            return Ok(Fence::signaled());
        }
        if self.needs_repin(vma) {
            self.pin_userptr(vma)?;
        }
        self.lock_for(ctx, vma);
        if let Some(obj) = vma.object() {
            obj.validate(self.id())?;
            if self.is_compute_mode() && obj.is_external() {
                self.arm_external(ctx, obj.reservation());
            }
        }

        let pages;
        let pinned;
        let object_pages;
        let src: &dyn DmaSource = match vma.backing() {
            VmaBacking::Object { obj, .. } => {
                object_pages = ObjectPages(obj.as_ref());
                &object_pages
            }
            VmaBacking::Userptr(u) => {
                pages = u.pages();
                pinned = Pinned(&pages);
                &pinned
            }
        };

        let attrs = vma.attrs();
        let mut prepared = Vec::new();
        for tile in tiles_in(vma.tile_mask()) {
            let p = state.tile(tile)?.prepare_bind(vma.range(), vma.offset(), src, attrs)?;
            prepared.push((tile, p));
        }

        let mut fences = FenceArray::new();
        let mut result = Ok(());
        for (tile, p) in prepared {
            let writes = match state.tile_mut(tile).and_then(|pt| pt.commit(p).map_err(VmError::from)) {
                Ok(w) => w,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };
            vma.set_present(tile);
            match self.device.backends.submitter.submit(tile, writes) {
                Ok(f) => fences.push(f),
                Err(e) => {
                    result = Err(e.into());
                    break;
                }
            }
        }
        let fence = fences.into_fence();
        self.publish(ctx, vma, &fence);
        if let Err(e) = result {
            self.undo_bind(state, ctx, vma);
            return Err(e);
        }

        vma.set_evicted(false);
        self.note_first_bind();
        if vma.is_userptr() && self.needs_repin(vma) {
            self.note_invalidated(vma);
        }
        debug!("vm{}: bound {:?} on tiles {:#b}", self.id(), vma.range(), vma.tile_present());
        Ok(fence)
    }

    /// Takes back the tiles a failed bind already committed.
    fn undo_bind(&self, state: &mut VmState, ctx: &mut AcquireContext, vma: &Vma) {
        if !vma.is_bound() {
            return;
        }
        warn!("vm{}: undoing partial bind of {:?} on tiles {:#b}", self.id(), vma.range(), vma.tile_present());
        if let (_, Err(e)) = self.clear_tiles(state, ctx, vma) {
            warn!("vm{}: clearing {:?} after a failed bind: {e}", self.id(), vma.range());
        }
    }

    /// Clears the entry's translations on every tile it is present on.
    pub(crate) fn unbind_vma(&self, state: &mut VmState, ctx: &mut AcquireContext, vma: &Vma) -> VmResult<Fence> {
        let (fence, result) = self.clear_tiles(state, ctx, vma);
        result.map(|()| fence)
    }

    /// Clears what it can and reports the first failure next to the fence of
    /// the clears that went out. Tiles whose table refused the clear keep
    /// their present bit.
    fn clear_tiles(&self, state: &mut VmState, ctx: &mut AcquireContext, vma: &Vma) -> (Fence, VmResult<()>) {
        let present = vma.take_present();
        if present == 0 {
            return (Fence::signaled(), Ok(()));
        }
        self.lock_for(ctx, vma);

        let backends = &self.device.backends;
        let mut fences = FenceArray::new();
        let mut result = Ok(());
        for tile in tiles_in(present) {
            let cleared = match state.tile_mut(tile).and_then(|pt| pt.unbind(vma.range()).map_err(VmError::from)) {
                Ok(c) => c,
                Err(e) => {
                    vma.restore_present(1 << tile);
                    result = result.and(Err(e));
                    continue;
                }
            };
            if !cleared.writes.is_empty() {
                match backends.submitter.submit(tile, cleared.writes) {
                    Ok(f) => fences.push(f),
                    Err(e) => result = result.and(Err(e.into())),
                }
            }
            fences.push(backends.tlb.invalidate(tile, vma.range()));
        }
        let fence = fences.into_fence();
        self.publish(ctx, vma, &fence);
        if result.is_ok() {
            debug!("vm{}: unbound {:?} from tiles {present:#b}", self.id(), vma.range());
        }
        (fence, result)
    }

    /// Zaps the entry's translations, leaving it in the tree.
    ///
    /// The fence covers the page-table writes and the TLB invalidation.
    ///
    /// # Errors
    /// Page-table or submission failures.
    pub fn invalidate_vma(&self, vma: &Arc<Vma>) -> VmResult<Fence> {
        let mut state = self.state.write();
        let mut ctx = AcquireContext::new();
        self.unbind_vma(&mut state, &mut ctx, vma)
    }

    /// [`invalidate_vma`](Self::invalidate_vma) and wait for it, bounded by
    /// the device TLB timeout.
    ///
    /// # Errors
    /// [`VmError::Timeout`] when the hardware does not acknowledge in time.
    pub fn invalidate_vma_sync(&self, vma: &Arc<Vma>) -> VmResult<()> {
        let timeout = self.device.config.tlb_timeout;
        self.invalidate_vma(vma)?.wait_timeout(timeout).map_err(|e| match e {
            FenceError::Timeout => {
                error!("vm{}: TLB invalidation of {:?} timed out", self.id(), vma.range());
                VmError::Timeout(timeout)
            }
            other => other.into(),
        })
    }

    /// Rebinds every queued entry.
    pub(crate) fn rebind_dirty(&self, state: &mut VmState, ctx: &mut AcquireContext) -> VmResult<Fence> {
        let dirty = self.take_rebind_list();
        let mut fences = FenceArray::new();
        for (i, vma) in dirty.iter().enumerate() {
            let immediate = !self.is_fault_mode() || vma.is_bound();
            match self.bind_vma(state, ctx, vma, immediate) {
                Ok(f) => fences.push(f),
                Err(e) => {
                    for v in &dirty[i..] {
                        self.queue_rebind(v);
                    }
                    return Err(e);
                }
            }
        }
        if !dirty.is_empty() {
            debug!("vm{}: rebound {} entries", self.id(), dirty.len());
        }
        Ok(fences.into_fence())
    }

    /// Repins invalidated userptrs and rebinds evicted entries; the
    /// submission path of address spaces without a rebind worker.
    ///
    /// # Errors
    /// Pin, residency and page-table failures; unfinished entries stay queued.
    pub fn rebind_evicted(&self) -> VmResult<Fence> {
        self.check_open()?;
        self.userptr_pin()?;
        let mut state = self.state.write();
        let mut ctx = AcquireContext::new();
        self.rebind_dirty(&mut state, &mut ctx)
    }
}
