//! # GPU virtual address spaces
//!
//! Per-context GPU address spaces on top of [`gpu_pgtable`]: the mapping
//! directory, the bind/unbind pipeline, host-memory (userptr) mappings
//! and the preemption protocol of long-running compute contexts.
//!
//! | Type | Role |
//! |------|------|
//! | [`GpuDevice`] | Device context; creates address spaces and hands out integer handles. |
//! | [`Vm`] | One address space: [`VmaTree`] plus a page-table tree per tile. |
//! | [`Vma`] | A mapping of an object or host range at a GPU address range. |
//! | [`BindRequest`] | Map, unmap, unmap-all or map-userptr, inline or queued. |
//! | [`BackingObject`] | Memory objects the memory manager may move. |
//! | [`ComputeEngine`] | Long-running context that is preempted instead of waited on. |
//!
//! Hardware access goes through [`PtSubmitter`] and [`TlbInvalidator`], host
//! pages through [`HostMemory`] and [`InvalidationNotifier`]. The [`sim`]
//! module implements all of them in software.
//!
//! Logging goes through the [`log`] facade; [`trace::StderrLogger`] is a
//! ready-made backend reading its level from `GPU_VM_LOG`.
//!
//! ## Example
//!
//! ```rust
//! # use std::sync::Arc;
//! # use gpu_addresses::{DmaAddress, GpuAddress};
//! # use gpu_vm::sim::{SimBackends, SimBuffer};
//! # use gpu_vm::*;
//! let sim = SimBackends::new();
//! let gpu = GpuDevice::new(DeviceConfig::default(), sim.backends()).unwrap();
//! let id = gpu.create_vm(VmFlags::empty()).unwrap();
//! let vm = gpu.lookup(id).unwrap();
//!
//! let buf = Arc::new(SimBuffer::new(0x4000, DmaAddress::new(0x4000_0000)));
//! vm.bind(BindRequest::map(buf, 0, 0x10_0000, 0x4000), BindSyncs::new())
//!     .unwrap()
//!     .wait()
//!     .unwrap();
//!
//! let t = vm.translate(0, GpuAddress::new(0x10_2008)).unwrap();
//! assert_eq!(t.addr, DmaAddress::new(0x4000_2008));
//!
//! vm.unbind(0x10_0000, 0x4000).unwrap().wait().unwrap();
//! assert!(vm.translate(0, GpuAddress::new(0x10_2008)).is_none());
//! ```

mod async_queue;
mod backing;
mod bind;
mod config;
mod device;
mod error;
mod hw;
mod preempt;
pub mod sim;
pub mod trace;
mod userptr;
mod vm;
mod vma;
mod vma_tree;

pub use async_queue::{AsyncErrorReport, ErrorSink};
pub use backing::{BackingHandle, BackingObject, ResidencyError, VmaLinks, notify_backing_moved};
pub use bind::{BindFlags, BindOp, BindOpKind, BindOutcome, BindRequest, BindSyncs};
pub use config::{DeviceConfig, MAX_TILES, VmFlags};
pub use device::{DeviceBackends, GpuDevice};
pub use error::{ErrorKind, VmError, VmResult};
pub use hw::{PtSubmitter, SubmitError, TlbInvalidator};
pub use preempt::ComputeEngine;
pub use userptr::{HostMemory, InvalidationListener, InvalidationNotifier, ListenerHandle, PinError};
pub use vm::{Vm, VmId};
pub use vma::{Userptr, Vma, VmaBacking};
pub use vma_tree::{UnmapResolution, VmaTree};
