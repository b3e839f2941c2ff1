mod common;

use common::{Fixture, PAGE, buffer, dma_at, range};
use gpu_addresses::{DmaAddress, GpuAddress};
use gpu_vm::sim::SimBackends;
use gpu_vm::{BindFlags, BindRequest, BindSyncs, DeviceConfig, ErrorKind, GpuDevice, VmError, VmFlags};
use std::time::Duration;

#[test]
fn handles_come_and_go() {
    let fx = Fixture::new();
    let a = fx.gpu.create_vm(VmFlags::empty()).unwrap();
    let b = fx.gpu.create_vm(VmFlags::FAULT_MODE).unwrap();
    assert_ne!(a, b);
    assert_eq!(fx.gpu.live_vms(), 2);
    assert_eq!(fx.gpu.fault_mode_vms(), 1);

    fx.gpu.destroy_vm(b).unwrap();
    fx.gpu.flush_teardown();
    assert_eq!(fx.gpu.live_vms(), 1);
    assert_eq!(fx.gpu.fault_mode_vms(), 0);
    assert_eq!(fx.gpu.lookup(b).unwrap_err(), VmError::NotFound(b));
    assert_eq!(fx.gpu.destroy_vm(b), Err(VmError::NotFound(b)));
    assert!(matches!(
        fx.gpu.vm_bind(b, vec![BindRequest::unmap(0, PAGE)], BindSyncs::new()),
        Err(VmError::NotFound(_))
    ));
    assert_eq!(fx.gpu.lookup(a).unwrap().id(), a);
    assert_eq!(fx.gpu.vm_restart(b), Err(VmError::NotFound(b)));
    assert!(matches!(fx.gpu.vm_restart(a), Err(VmError::InvalidArgument(_))));

    fx.gpu.shutdown();
    assert_eq!(fx.gpu.live_vms(), 0);
}

#[test]
fn address_space_outlives_its_handle() {
    let fx = Fixture::new();
    let id = fx.gpu.create_vm(VmFlags::empty()).unwrap();
    let vm = fx.gpu.lookup(id).unwrap();
    let obj = buffer(1, 0x4000_0000);
    vm.bind(BindRequest::map(obj, 0, 0x10_0000, PAGE), BindSyncs::new())
        .unwrap();

    fx.gpu.destroy_vm(id).unwrap();
    assert!(vm.is_closed());
    assert_eq!(fx.gpu.live_vms(), 1);
    assert_eq!(
        vm.bind(BindRequest::unmap(0x10_0000, PAGE), BindSyncs::new()).unwrap_err(),
        VmError::Closed
    );
    // reads keep working until the last reference goes
    assert!(dma_at(&vm, 0, 0x10_0000).is_some());

    drop(vm);
    fx.gpu.flush_teardown();
    assert_eq!(fx.gpu.live_vms(), 0);
}

#[test]
fn teardown_returns_page_table_pages() {
    let fx = Fixture::new();
    let baseline = fx.sim.tables.live_tables();
    let id = fx.gpu.create_vm(VmFlags::empty()).unwrap();
    let vm = fx.gpu.lookup(id).unwrap();
    vm.bind(BindRequest::map(buffer(4, 0x4000_0000), 0, 0x10_0000, 4 * PAGE), BindSyncs::new())
        .unwrap();
    assert!(fx.sim.tables.live_tables() > baseline);

    drop(vm);
    fx.gpu.destroy_vm(id).unwrap();
    fx.gpu.flush_teardown();
    assert_eq!(fx.sim.tables.live_tables(), baseline);
}

#[test]
fn creation_flags_are_checked() {
    let fx = Fixture::new();
    for flags in [
        VmFlags::FAULT_MODE | VmFlags::COMPUTE_MODE,
        VmFlags::FAULT_MODE | VmFlags::SCRATCH_PAGE,
    ] {
        assert!(matches!(fx.gpu.create_vm(flags), Err(VmError::InvalidArgument(_))), "{flags:?}");
    }
    assert_eq!(fx.gpu.live_vms(), 0);

    let no_faults = Fixture::with_config(DeviceConfig {
        supports_fault_mode: false,
        ..DeviceConfig::default()
    });
    assert!(no_faults.gpu.create_vm(VmFlags::FAULT_MODE).is_err());
    no_faults
        .gpu
        .create_vm(VmFlags::SCRATCH_PAGE | VmFlags::COMPUTE_MODE | VmFlags::ASYNC_BIND_OPS)
        .unwrap();
}

#[test]
fn device_layout_is_checked() {
    let sim = SimBackends::new();
    for config in [
        DeviceConfig {
            tiles: 0,
            ..DeviceConfig::default()
        },
        DeviceConfig {
            va_bits: 64,
            ..DeviceConfig::default()
        },
        DeviceConfig {
            scratch_page: DmaAddress::new(0x1234),
            ..DeviceConfig::default()
        },
    ] {
        assert!(GpuDevice::new(config, sim.backends()).is_err());
    }
}

#[test]
fn smaller_address_spaces_bound_requests() {
    let fx = Fixture::with_config(DeviceConfig {
        va_bits: 39,
        ..DeviceConfig::default()
    });
    let vm = fx.vm(VmFlags::empty());
    assert_eq!(vm.size(), 1 << 39);
    let err = vm
        .bind(BindRequest::map(buffer(1, 0x4000_0000), 0, 1 << 39, PAGE), BindSyncs::new())
        .unwrap_err();
    assert!(matches!(err, VmError::OutOfBounds { .. }));
    vm.bind(BindRequest::map(buffer(1, 0x4000_0000), 0, (1 << 39) - PAGE, PAGE), BindSyncs::new())
        .unwrap();
}

#[test]
fn fault_mode_defers_population() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::FAULT_MODE);
    let obj = buffer(8, 0x4000_0000);

    let f = vm
        .bind(BindRequest::map(obj.clone(), 0, 0x10_0000, 8 * PAGE), BindSyncs::new())
        .unwrap();
    assert!(f.is_signaled());
    let lazy = vm.lookup(GpuAddress::new(0x10_0000)).unwrap();
    assert!(!lazy.is_bound());
    assert_eq!(dma_at(&vm, 0, 0x10_0000), None);
    assert_eq!(fx.sim.submitter.jobs(), 0);

    vm.bind(
        BindRequest::map(obj, 0, 0x20_0000, 8 * PAGE).with_flags(BindFlags::IMMEDIATE),
        BindSyncs::new(),
    )
    .unwrap();
    assert_eq!(dma_at(&vm, 0, 0x20_0000), Some(DmaAddress::new(0x4000_0000)));

    // Splitting an unpopulated entry keeps the remainders unpopulated.
    vm.unbind(0x10_0000 + 2 * PAGE, 2 * PAGE).unwrap();
    let maps = vm.mappings();
    assert_eq!(maps.len(), 3);
    assert!(!maps[0].is_bound() && !maps[1].is_bound());
    assert_eq!(maps[1].offset(), 4 * PAGE);
    assert_eq!(vm.live_entries(0, range(0x10_0000, 8 * PAGE)), 0);

    // and populated remainders stay populated
    vm.unbind(0x20_0000, PAGE).unwrap();
    let tail = vm.lookup(GpuAddress::new(0x20_0000 + PAGE)).unwrap();
    assert!(tail.is_bound());
    assert_eq!(vm.live_entries(0, range(0x20_0000, 8 * PAGE)), 7);
}

#[test]
fn unacknowledged_tlb_invalidation_times_out() {
    let fx = Fixture::with_config(DeviceConfig {
        tlb_timeout: Duration::from_millis(30),
        ..DeviceConfig::default()
    });
    let vm = fx.vm(VmFlags::FAULT_MODE);
    vm.bind(
        BindRequest::map(buffer(2, 0x4000_0000), 0, 0x10_0000, 2 * PAGE).with_flags(BindFlags::IMMEDIATE),
        BindSyncs::new(),
    )
    .unwrap();
    let vma = vm.lookup(GpuAddress::new(0x10_0000)).unwrap();

    fx.sim.tlb.set_responsive(false);
    let err = vm.invalidate_vma_sync(&vma).unwrap_err();
    assert_eq!(err, VmError::Timeout(Duration::from_millis(30)));
    assert_eq!(err.kind(), ErrorKind::Timeout);
    // the entries themselves are gone, only the acknowledgement is missing
    assert!(!vma.is_bound());
    assert_eq!(dma_at(&vm, 0, 0x10_0000), None);

    fx.sim.tlb.set_responsive(true);
    assert!(vm.invalidate_vma(&vma).unwrap().is_signaled());
}

#[test]
fn scratch_page_address_spaces_bind_like_any_other() {
    let fx = Fixture::with_config(DeviceConfig {
        scratch_page: DmaAddress::new(0xdead_0000),
        ..DeviceConfig::default()
    });
    let vm = fx.vm(VmFlags::SCRATCH_PAGE);
    let r = range(0x10_0000, 2 * PAGE);

    vm.bind(BindRequest::map(buffer(2, 0x4000_0000), 0, 0x10_0000, 2 * PAGE), BindSyncs::new())
        .unwrap();
    assert_eq!(dma_at(&vm, 0, 0x10_1000), Some(DmaAddress::new(0x4000_1000)));
    vm.unbind(0x10_0000, 2 * PAGE).unwrap();
    // cleared leaves point at the scratch page but hold no translation
    assert_eq!(dma_at(&vm, 0, 0x10_1000), None);
    assert_eq!(vm.live_entries(0, r), 0);
}
