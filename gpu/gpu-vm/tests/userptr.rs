mod common;

use common::{Fixture, PAGE, dma_at, eventually, range};
use gpu_addresses::GpuAddress;
use gpu_vm::{BindFlags, BindRequest, BindSyncs, ErrorKind, VmError, VmFlags};
use std::time::Duration;

const HOST: u64 = 0x20_0000;
const VA: u64 = 0x10000;

#[test]
fn middle_page_unmap_leaves_a_hole() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::empty());
    assert_eq!(vm.size(), 1 << 48);

    vm.bind(BindRequest::map_userptr(HOST, VA, 3 * PAGE), BindSyncs::new())
        .unwrap()
        .wait()
        .unwrap();
    let maps = vm.mappings();
    assert_eq!(maps.len(), 1);
    assert_eq!(maps[0].range(), range(VA, 3 * PAGE));
    assert_eq!(fx.sim.host.pinned_pages(), 3);

    vm.unbind(VA + PAGE, PAGE).unwrap().wait().unwrap();

    let ranges: Vec<_> = vm.mappings().iter().map(|v| v.range()).collect();
    assert_eq!(ranges, vec![range(VA, PAGE), range(VA + 2 * PAGE, PAGE)]);
    assert_eq!(vm.live_entries(0, range(VA + PAGE, PAGE)), 0);
    assert_eq!(vm.live_entries(0, range(VA, 3 * PAGE)), 2);
    assert_eq!(dma_at(&vm, 0, VA + PAGE), None);
    assert_eq!(dma_at(&vm, 0, VA), Some(fx.sim.host.dma_for(HOST)));
    assert_eq!(dma_at(&vm, 0, VA + 2 * PAGE), Some(fx.sim.host.dma_for(HOST + 2 * PAGE)));

    // the remainders hold their own pins and listeners
    assert_eq!(fx.sim.host.pinned_pages(), 2);
    assert_eq!(fx.sim.host.listeners(), 2);
    assert_eq!(vm.userptr_count(), 2);
    let tail = vm.lookup(GpuAddress::new(VA + 2 * PAGE)).unwrap();
    assert_eq!(tail.userptr().unwrap().host_addr(), HOST + 2 * PAGE);
}

#[test]
fn failed_unbind_still_releases_pins() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::empty());
    vm.bind(BindRequest::map_userptr(HOST, VA, 3 * PAGE), BindSyncs::new())
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(fx.sim.host.pinned_pages(), 3);
    assert_eq!(fx.sim.host.listeners(), 1);

    fx.sim.submitter.set_fail(true);
    let err = vm.unbind(VA, 3 * PAGE).unwrap_err();
    assert!(matches!(err, VmError::Submit(_)));
    assert!(vm.mappings().is_empty());
    assert_eq!(vm.userptr_count(), 0);
    assert_eq!(dma_at(&vm, 0, VA), None);
    assert!(eventually(Duration::from_secs(5), || fx.sim.host.pinned_pages() == 0));
    assert_eq!(fx.sim.host.listeners(), 0);
}

#[test]
fn failed_bind_releases_pins() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::empty());
    fx.sim.submitter.set_fail(true);
    let err = vm
        .bind(BindRequest::map_userptr(HOST, VA, 2 * PAGE), BindSyncs::new())
        .unwrap_err();
    assert!(matches!(err, VmError::Submit(_)));
    assert!(vm.mappings().is_empty());
    assert_eq!(vm.live_entries(0, range(VA, 2 * PAGE)), 0);
    assert_eq!(fx.sim.host.pinned_pages(), 0);
    assert_eq!(fx.sim.host.listeners(), 0);
    assert_eq!(vm.userptr_count(), 0);
}

#[test]
fn invalidation_requires_repin() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::empty());
    vm.bind(BindRequest::map_userptr(HOST, VA, 3 * PAGE), BindSyncs::new())
        .unwrap();
    let vma = vm.lookup(GpuAddress::new(VA)).unwrap();
    let old = dma_at(&vm, 0, VA).unwrap();
    assert!(!vm.needs_repin(&vma));
    assert!(vm.is_translation_valid(&vma));
    vm.userptr_check_repin().unwrap();

    assert_eq!(fx.sim.host.invalidate(HOST + PAGE..HOST + 2 * PAGE), 1);

    assert!(vm.needs_repin(&vma));
    assert!(!vm.is_translation_valid(&vma));
    assert_eq!(vm.invalidated_userptrs(), 1);
    assert_eq!(vm.userptr_check_repin(), Err(VmError::Again));
    // nothing changes until someone repins
    assert!(vm.needs_repin(&vma));

    assert_eq!(vm.userptr_pin().unwrap(), 1);
    assert!(!vm.needs_repin(&vma));
    vm.userptr_check_repin().unwrap();
    assert_eq!(vm.pending_rebinds(), 1);
    assert_eq!(fx.sim.host.pinned_pages(), 3);

    vm.rebind_evicted().unwrap().wait().unwrap();
    assert_eq!(vm.pending_rebinds(), 0);
    assert!(vm.is_translation_valid(&vma));
    let new = dma_at(&vm, 0, VA).unwrap();
    assert_ne!(new, old);
    assert_eq!(new, fx.sim.host.dma_for(HOST));
}

#[test]
fn invalidation_before_first_bind_is_ignored() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::FAULT_MODE);
    vm.bind(BindRequest::map_userptr(HOST, VA, PAGE), BindSyncs::new())
        .unwrap();
    fx.sim.host.invalidate(HOST..HOST + PAGE);
    assert_eq!(vm.invalidated_userptrs(), 0);
    assert!(fx.sim.tlb.invalidations().is_empty());
}

#[test]
fn fault_mode_invalidation_zaps_translations() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::FAULT_MODE);
    vm.bind(
        BindRequest::map_userptr(HOST, VA, 2 * PAGE).with_flags(BindFlags::IMMEDIATE),
        BindSyncs::new(),
    )
    .unwrap();
    let vma = vm.lookup(GpuAddress::new(VA)).unwrap();
    assert!(vma.is_bound());

    fx.sim.host.invalidate(HOST..HOST + PAGE);

    assert!(!vma.is_bound());
    assert_eq!(dma_at(&vm, 0, VA), None);
    assert_eq!(vm.live_entries(0, vma.range()), 0);
    assert_eq!(fx.sim.tlb.invalidations(), vec![(0, vma.range())]);
    assert!(vm.needs_repin(&vma));
    // still mapped, only the translations went away
    assert_eq!(vm.mappings().len(), 1);
}

#[test]
fn pin_failure_is_a_resource_error() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::empty());
    fx.sim.host.set_fail_pin(true);
    let err = vm
        .bind(BindRequest::map_userptr(HOST, VA, PAGE), BindSyncs::new())
        .unwrap_err();
    assert!(matches!(err, VmError::Pin(_)));
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert!(vm.mappings().is_empty());
    assert_eq!(vm.userptr_count(), 0);
    assert_eq!(fx.sim.host.listeners(), 0);
}

#[test]
fn failed_repin_keeps_entry_invalidated() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::empty());
    vm.bind(BindRequest::map_userptr(HOST, VA, PAGE), BindSyncs::new())
        .unwrap();
    fx.sim.host.invalidate(HOST..HOST + PAGE);
    fx.sim.host.set_fail_pin(true);

    assert!(matches!(vm.userptr_pin(), Err(VmError::Pin(_))));
    assert_eq!(vm.invalidated_userptrs(), 1);
    assert_eq!(vm.userptr_check_repin(), Err(VmError::Again));

    fx.sim.host.set_fail_pin(false);
    assert_eq!(vm.userptr_pin().unwrap(), 1);
    vm.userptr_check_repin().unwrap();
}

#[test]
fn teardown_releases_pins_and_listeners() {
    let fx = Fixture::new();
    let id = fx.gpu.create_vm(VmFlags::empty()).unwrap();
    let vm = fx.gpu.lookup(id).unwrap();
    vm.bind(BindRequest::map_userptr(HOST, VA, 4 * PAGE), BindSyncs::new())
        .unwrap();
    assert_eq!(fx.sim.host.pinned_pages(), 4);
    drop(vm);

    fx.gpu.destroy_vm(id).unwrap();
    fx.gpu.flush_teardown();
    assert_eq!(fx.sim.host.pinned_pages(), 0);
    assert_eq!(fx.sim.host.listeners(), 0);
    assert_eq!(fx.gpu.live_vms(), 0);
}
