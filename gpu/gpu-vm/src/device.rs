//! Device context and the handle-based control surface.

use crate::bind::{BindOutcome, BindRequest, BindSyncs};
use crate::hw::{PtSubmitter, TlbInvalidator};
use crate::userptr::{HostMemory, InvalidationNotifier};
use crate::vm::{Vm, VmId};
use crate::{DeviceConfig, VmError, VmFlags, VmResult};
use gpu_pgtable::TableAllocator;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread::JoinHandle;

/// Collaborators every address space on a device talks to.
#[derive(Clone)]
pub struct DeviceBackends {
    pub tables: Arc<dyn TableAllocator>,
    pub submitter: Arc<dyn PtSubmitter>,
    pub tlb: Arc<dyn TlbInvalidator>,
    pub host: Arc<dyn HostMemory>,
    pub notifier: Arc<dyn InvalidationNotifier>,
}

/// State shared between the device and its address spaces.
pub(crate) struct DeviceShared {
    pub(crate) config: DeviceConfig,
    pub(crate) backends: DeviceBackends,
    live_vms: AtomicUsize,
    fault_mode_vms: AtomicUsize,
    teardowns: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceShared {
    pub(crate) fn vm_created(&self, flags: VmFlags) {
        self.live_vms.fetch_add(1, Ordering::AcqRel);
        if flags.contains(VmFlags::FAULT_MODE) {
            self.fault_mode_vms.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn vm_destroyed(&self, flags: VmFlags) {
        self.live_vms.fetch_sub(1, Ordering::AcqRel);
        if flags.contains(VmFlags::FAULT_MODE) {
            self.fault_mode_vms.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn push_teardown(&self, handle: JoinHandle<()>) {
        let mut teardowns = self.teardowns.lock();
        teardowns.retain(|h| !h.is_finished());
        teardowns.push(handle);
    }
}

/// One GPU: its configuration, collaborators and open address spaces.
///
/// Address spaces are addressed by small integer handles. Destroying a
/// handle drops the device's reference; teardown completes once the last
/// user lets go.
pub struct GpuDevice {
    shared: Arc<DeviceShared>,
    vms: Mutex<HashMap<VmId, Arc<Vm>>>,
    next_id: AtomicU32,
}

impl GpuDevice {
    /// # Errors
    /// [`VmError::InvalidArgument`] for an unsupported layout.
    pub fn new(config: DeviceConfig, backends: DeviceBackends) -> VmResult<Self> {
        config.validate()?;
        info!(
            "gpu: {} tiles, {}-bit address spaces, fault mode {}",
            config.tiles,
            config.va_bits,
            if config.supports_fault_mode { "supported" } else { "unsupported" }
        );
        Ok(Self {
            shared: Arc::new(DeviceShared {
                config,
                backends,
                live_vms: AtomicUsize::new(0),
                fault_mode_vms: AtomicUsize::new(0),
                teardowns: Mutex::new(Vec::new()),
            }),
            vms: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        })
    }

    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    /// # Errors
    /// Invalid flag combinations, or page-table allocation failure.
    pub fn create_vm(&self, flags: VmFlags) -> VmResult<VmId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let vm = Vm::create(&self.shared, id, flags)?;
        self.vms.lock().insert(id, vm);
        Ok(id)
    }

    /// Closes the address space and drops the handle.
    ///
    /// # Errors
    /// [`VmError::NotFound`].
    pub fn destroy_vm(&self, id: VmId) -> VmResult<()> {
        let vm = self.vms.lock().remove(&id).ok_or(VmError::NotFound(id))?;
        vm.close();
        Ok(())
    }

    /// # Errors
    /// [`VmError::NotFound`].
    pub fn lookup(&self, id: VmId) -> VmResult<Arc<Vm>> {
        self.vms.lock().get(&id).cloned().ok_or(VmError::NotFound(id))
    }

    /// Runs a batch of bind operations on address space `id`.
    ///
    /// # Errors
    /// As [`Vm::submit`].
    pub fn vm_bind(&self, id: VmId, ops: Vec<BindRequest>, syncs: BindSyncs) -> VmResult<BindOutcome> {
        self.lookup(id)?.submit(ops, syncs)
    }

    /// Clears the async error latch of address space `id`.
    ///
    /// # Errors
    /// [`VmError::NotFound`], or [`VmError::InvalidArgument`] when the address
    /// space has no async queue.
    pub fn vm_restart(&self, id: VmId) -> VmResult<()> {
        self.lookup(id)?.restart()
    }

    #[must_use]
    pub fn live_vms(&self) -> usize {
        self.shared.live_vms.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn fault_mode_vms(&self) -> usize {
        self.shared.fault_mode_vms.load(Ordering::Acquire)
    }

    /// Waits for every deferred address-space teardown started so far.
    pub fn flush_teardown(&self) {
        let handles = std::mem::take(&mut *self.shared.teardowns.lock());
        for h in handles {
            if h.join().is_err() {
                warn!("gpu: address-space teardown panicked");
            }
        }
    }

    /// Destroys every open address space and waits for their teardown.
    pub fn shutdown(&self) {
        let vms: Vec<_> = self.vms.lock().drain().collect();
        if !vms.is_empty() {
            info!("gpu: shutting down {} address spaces", vms.len());
        }
        for (_, vm) in &vms {
            vm.close();
        }
        drop(vms);
        self.flush_teardown();
    }
}

impl Drop for GpuDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}
