#![allow(dead_code)]

use gpu_addresses::{DmaAddress, GpuAddress, VaRange};
use gpu_vm::sim::{SimBackends, SimBuffer};
use gpu_vm::trace::StderrLogger;
use gpu_vm::{DeviceConfig, GpuDevice, Vm, VmFlags};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const PAGE: u64 = 4096;

pub struct Fixture {
    pub gpu: GpuDevice,
    pub sim: SimBackends,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(DeviceConfig::default())
    }

    pub fn with_config(config: DeviceConfig) -> Self {
        StderrLogger::init_for_tests();
        let sim = SimBackends::new();
        let gpu = GpuDevice::new(config, sim.backends()).unwrap();
        Self { gpu, sim }
    }

    pub fn vm(&self, flags: VmFlags) -> Arc<Vm> {
        let id = self.gpu.create_vm(flags).unwrap();
        self.gpu.lookup(id).unwrap()
    }
}

pub fn buffer(pages: u64, base: u64) -> Arc<SimBuffer> {
    Arc::new(SimBuffer::new(pages * PAGE, DmaAddress::new(base)))
}

pub fn range(start: u64, len: u64) -> VaRange {
    VaRange::from_len(GpuAddress::new(start), len).unwrap()
}

pub fn dma_at(vm: &Vm, tile: u8, addr: u64) -> Option<DmaAddress> {
    vm.translate(tile, GpuAddress::new(addr)).map(|t| t.addr)
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
