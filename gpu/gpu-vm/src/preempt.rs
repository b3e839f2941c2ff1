//! # Preemption fences and the rebind worker
//!
//! Compute engines run indefinitely and never produce completion fences
//! the memory manager could wait on. Instead each attached engine gets a
//! *preemption fence*: a fence whose enable-signaling hook suspends the
//! engine and which completes once the engine is off the hardware. The
//! fence sits with [`FenceUsage::Bookkeep`] on the address-space
//! reservation and on every external object, so anyone waiting for all
//! users of that memory preempts the engine first.
//!
//! The rebind worker of a compute address space brings it back:
//!
//! 1. repin invalidated userptrs
//! 2. lock the address space and every external object
//! 3. wait out the old preemption fences, allocate fresh ones
//! 4. validate evicted objects and
//! 5. rebind every dirty entry into one combined fence
//! 6. wait for it, bounded by the migration timeout
//! 7. install the fresh fences, resume the engines
//! 8. start over if a userptr was invalidated meanwhile
//!
//! Any failure kills the address space so no engine runs on stale
//! translations.

use crate::vm::{Vm, VmState};
use crate::{VmError, VmResult};
use gpu_sync::{AcquireContext, Fence, FenceError, FenceUsage, Reservation};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};

/// A long-running execution context on the GPU.
pub trait ComputeEngine: Send + Sync {
    fn id(&self) -> u64;

    /// Starts taking the engine off the hardware; the fence signals once it
    /// stopped touching memory.
    fn suspend(&self) -> Fence;

    fn resume(&self);

    /// Permanently stops the engine.
    fn kill(&self) {}
}

struct EngineSlot {
    engine: Arc<dyn ComputeEngine>,
    fence: Fence,
}

#[derive(Default)]
pub(crate) struct PreemptState {
    slots: Vec<EngineSlot>,
}

impl PreemptState {
    pub(crate) fn engines(&self) -> Vec<Arc<dyn ComputeEngine>> {
        self.slots.iter().map(|s| Arc::clone(&s.engine)).collect()
    }

    fn fences(&self) -> Vec<Fence> {
        self.slots.iter().map(|s| s.fence.clone()).collect()
    }
}

fn preempt_fence(engine: &Arc<dyn ComputeEngine>) -> Fence {
    let engine = Arc::clone(engine);
    Fence::with_enable_signaling(move |fence| {
        debug!("engine {}: preemption requested", engine.id());
        fence.follow(&engine.suspend());
    })
}

#[derive(Default)]
struct KickState {
    pending: bool,
    shutdown: bool,
}

/// Wakes the rebind worker.
#[derive(Default)]
pub(crate) struct RebindKick {
    state: Mutex<KickState>,
    cond: Condvar,
}

impl RebindKick {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn kick(&self) {
        self.state.lock().pending = true;
        self.cond.notify_one();
    }

    pub(crate) fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cond.notify_all();
    }

    /// `false` once shut down.
    fn wait(&self) -> bool {
        let mut st = self.state.lock();
        while !st.pending && !st.shutdown {
            self.cond.wait(&mut st);
        }
        if st.shutdown {
            return false;
        }
        st.pending = false;
        true
    }
}

pub(crate) fn spawn_rebind_worker(vm: &Arc<Vm>) -> VmResult<()> {
    let weak = Arc::downgrade(vm);
    let kick = Arc::clone(&vm.rebind_kick);
    std::thread::Builder::new()
        .name(format!("vm{}-rebind", vm.id()))
        .spawn(move || rebind_worker(&weak, &kick))
        .map(drop)
        .map_err(|e| VmError::Spawn(e.to_string()))
}

fn rebind_worker(vm: &Weak<Vm>, kick: &RebindKick) {
    while kick.wait() {
        let Some(vm) = vm.upgrade() else {
            break;
        };
        if let Err(e) = vm.preempt_rebind() {
            vm.kill(&e);
            break;
        }
    }
    debug!("rebind worker exiting");
}

impl Vm {
    /// Reservations of the external objects mapped in this address space.
    fn external_resvs(state: &VmState) -> Vec<Arc<Reservation>> {
        let mut resvs: Vec<_> = state
            .vmas
            .iter()
            .filter_map(|v| v.object())
            .filter(|o| o.is_external())
            .map(|o| Arc::clone(o.reservation()))
            .collect();
        resvs.sort_by_key(|r| r.id());
        resvs.dedup_by_key(|r| r.id());
        resvs
    }

    /// Puts the current preemption fences on a newly mapped external object.
    pub(crate) fn arm_external(&self, ctx: &AcquireContext, resv: &Reservation) {
        for fence in self.preempt.lock().fences() {
            resv.add_fence(ctx, fence, FenceUsage::Bookkeep);
        }
    }

    /// Attaches a compute engine and arms its preemption fence.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] unless the address space is in compute
    /// mode; [`VmError::Closed`] / [`VmError::Killed`].
    pub fn attach_compute_engine(&self, engine: Arc<dyn ComputeEngine>) -> VmResult<()> {
        if !self.is_compute_mode() {
            return Err(VmError::InvalidArgument("compute engines need a compute-mode address space"));
        }
        self.check_open()?;
        let state = self.state.read();
        let ext = Self::external_resvs(&state);
        let mut ctx = AcquireContext::new();
        ctx.lock_all(std::iter::once(&self.resv).chain(&ext));

        let fence = preempt_fence(&engine);
        for resv in std::iter::once(&self.resv).chain(&ext) {
            resv.add_fence(&ctx, fence.clone(), FenceUsage::Bookkeep);
        }
        info!("vm{}: engine {} attached", self.id(), engine.id());
        self.preempt.lock().slots.push(EngineSlot { engine, fence });
        Ok(())
    }

    /// Detaches engine `id`; returns whether it was attached.
    pub fn detach_compute_engine(&self, id: u64) -> bool {
        let slot = {
            let mut pre = self.preempt.lock();
            let Some(pos) = pre.slots.iter().position(|s| s.engine.id() == id) else {
                return false;
            };
            pre.slots.remove(pos)
        };
        let state = self.state.read();
        let ext = Self::external_resvs(&state);
        let mut ctx = AcquireContext::new();
        ctx.lock_all(std::iter::once(&self.resv).chain(&ext));
        for resv in std::iter::once(&self.resv).chain(&ext) {
            resv.remove_fence(&ctx, &slot.fence);
        }
        slot.fence.signal();
        info!("vm{}: engine {id} detached", self.id());
        true
    }

    pub(crate) fn detach_all_engines(&self) {
        let slots = std::mem::take(&mut self.preempt.lock().slots);
        for slot in slots {
            slot.fence.signal();
        }
    }

    #[must_use]
    pub fn compute_engines(&self) -> usize {
        self.preempt.lock().slots.len()
    }

    /// One full pass of the rebind protocol, repeated while userptrs keep
    /// getting invalidated.
    pub(crate) fn preempt_rebind(&self) -> VmResult<()> {
        let mut passes = 0u32;
        loop {
            if self.is_closed() {
                return Ok(());
            }
            passes += 1;
            self.userptr_pin()?;

            let mut state = self.state.write();
            let ext = Self::external_resvs(&state);
            let mut ctx = AcquireContext::new();
            ctx.lock_all(std::iter::once(&self.resv).chain(&ext));

            let current: Vec<_> = self
                .preempt
                .lock()
                .slots
                .iter()
                .map(|s| (Arc::clone(&s.engine), s.fence.clone()))
                .collect();
            let mut fresh = Vec::with_capacity(current.len());
            for (engine, old) in &current {
                old.wait()?;
                fresh.push(preempt_fence(engine));
            }

            let rebound = self.rebind_dirty(&mut state, &mut ctx)?;
            let timeout = self.device.config.migrate_timeout;
            rebound.wait_timeout(timeout).map_err(|e| match e {
                FenceError::Timeout => VmError::Timeout(timeout),
                other => other.into(),
            })?;

            {
                let mut pre = self.preempt.lock();
                for ((engine, old), new) in current.iter().zip(fresh) {
                    for resv in std::iter::once(&self.resv).chain(&ext) {
                        resv.remove_fence(&ctx, old);
                    }
                    let Some(slot) = pre.slots.iter_mut().find(|s| s.engine.id() == engine.id()) else {
                        // Detached while we were rebinding.
                        new.signal();
                        continue;
                    };
                    for resv in std::iter::once(&self.resv).chain(&ext) {
                        resv.add_fence(&ctx, new.clone(), FenceUsage::Bookkeep);
                    }
                    slot.fence = new;
                }
            }
            for (engine, _) in &current {
                engine.resume();
            }
            drop(ctx);
            drop(state);

            if self.invalidated_userptrs() == 0 {
                debug!("vm{}: rebind done after {passes} passes", self.id());
                return Ok(());
            }
            warn!("vm{}: userptr invalidated during rebind, retrying", self.id());
        }
    }
}
