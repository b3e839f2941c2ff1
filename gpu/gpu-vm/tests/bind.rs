mod common;

use common::{Fixture, PAGE, buffer, dma_at, range};
use gpu_addresses::{DmaAddress, GpuAddress, PageSize, Size2M, Size4K};
use gpu_sync::{Fence, FenceError, FenceUsage};
use gpu_vm::{
    BackingObject, BindFlags, BindOutcome, BindRequest, BindSyncs, DeviceConfig, ErrorKind, VmError, VmFlags,
};
use proptest::prelude::*;
use std::thread;
use std::time::Duration;

#[test]
fn partial_unmap_keeps_both_remainders() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::empty());
    let base = 0x100_0000;
    let obj = buffer(100, 0x4000_0000);

    vm.bind(BindRequest::map(obj.clone(), 0, base, 100 * PAGE), BindSyncs::new())
        .unwrap()
        .wait()
        .unwrap();
    vm.unbind(base + 20 * PAGE, 40 * PAGE).unwrap().wait().unwrap();

    let maps = vm.mappings();
    assert_eq!(maps.len(), 2);
    assert_eq!(maps[0].range(), range(base, 20 * PAGE));
    assert_eq!(maps[0].offset(), 0);
    assert_eq!(maps[1].range(), range(base + 60 * PAGE, 40 * PAGE));
    assert_eq!(maps[1].offset(), 60 * PAGE);
    assert!(maps.iter().all(|v| v.is_bound()));
    assert_eq!(obj.vma_links().len(), 2);

    assert_eq!(dma_at(&vm, 0, base + 5 * PAGE + 8), Some(DmaAddress::new(0x4000_0000 + 5 * PAGE + 8)));
    assert_eq!(dma_at(&vm, 0, base + 70 * PAGE), Some(DmaAddress::new(0x4000_0000 + 70 * PAGE)));
    assert_eq!(dma_at(&vm, 0, base + 20 * PAGE), None);
    assert_eq!(vm.live_entries(0, range(base + 20 * PAGE, 40 * PAGE)), 0);
    assert_eq!(vm.live_entries(0, range(base, 100 * PAGE)), 60);
}

#[test]
fn unmap_across_two_entries_and_a_hole() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::empty());
    let a = 0x20_0000;
    let obj = buffer(2, 0x4000_0000);
    let other = buffer(2, 0x5000_0000);
    vm.bind(BindRequest::map(obj, 0, a, 2 * PAGE), BindSyncs::new()).unwrap();
    vm.bind(BindRequest::map(other, 0, a + 4 * PAGE, 2 * PAGE), BindSyncs::new())
        .unwrap();

    vm.unbind(a + PAGE, 4 * PAGE).unwrap().wait().unwrap();

    let ranges: Vec<_> = vm.mappings().iter().map(|v| v.range()).collect();
    assert_eq!(ranges, vec![range(a, PAGE), range(a + 5 * PAGE, PAGE)]);
    assert_eq!(dma_at(&vm, 0, a), Some(DmaAddress::new(0x4000_0000)));
    assert_eq!(dma_at(&vm, 0, a + 5 * PAGE), Some(DmaAddress::new(0x5000_0000 + PAGE)));
}

#[test]
fn bind_then_unbind_leaves_nothing() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::empty());
    let r = range(0x7_0000_0000, 16 * PAGE);
    let obj = buffer(16, 0x4000_0000);

    vm.bind(BindRequest::map(obj.clone(), 0, r.start().as_u64(), r.len()), BindSyncs::new())
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(vm.live_entries(0, r), 16);

    vm.unbind(r.start().as_u64(), r.len()).unwrap().wait().unwrap();
    assert!(vm.mappings().is_empty());
    assert!(vm.lookup(r.start()).is_none());
    assert_eq!(vm.live_entries(0, r), 0);
    assert!(obj.vma_links().is_empty());
    // one invalidation per unbound tile
    assert_eq!(fx.sim.tlb.invalidations(), vec![(0, r)]);
}

#[test]
fn unmapping_nothing_is_a_no_op() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::empty());
    let f = vm.unbind(0x10_0000, PAGE).unwrap();
    assert!(f.is_signaled());
    assert_eq!(fx.sim.submitter.jobs(), 0);
}

#[test]
fn aligned_contiguous_range_collapses_into_one_entry() {
    let r = range(0x4020_0000, Size2M::SIZE);
    let pages = Size2M::SIZE / PAGE;

    let fx = Fixture::new();
    let huge = fx.vm(VmFlags::empty());
    huge.bind(BindRequest::map(buffer(pages, 0x8000_0000), 0, r.start().as_u64(), r.len()), BindSyncs::new())
        .unwrap();

    let small_fx = Fixture::with_config(DeviceConfig {
        huge_pages: false,
        ..DeviceConfig::default()
    });
    let small = small_fx.vm(VmFlags::empty());
    small
        .bind(BindRequest::map(buffer(pages, 0x8000_0000), 0, r.start().as_u64(), r.len()), BindSyncs::new())
        .unwrap();

    assert_eq!(huge.live_entries(0, r), 1);
    assert_eq!(small.live_entries(0, r), 512);
    for page in 0..r.page_count::<Size4K>() {
        let va = r.start() + page * Size4K::SIZE;
        let h = huge.translate(0, va).unwrap();
        let s = small.translate(0, va).unwrap();
        assert_eq!(h.addr, s.addr, "page {page}");
        assert_eq!(h.level, 1);
    }
}

#[test]
fn malformed_requests_are_rejected_up_front() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::empty());
    let obj = buffer(4, 0x4000_0000);
    vm.bind(BindRequest::map(obj.clone(), 0, 0x10_0000, 2 * PAGE), BindSyncs::new())
        .unwrap();

    let bind = |req: BindRequest| vm.bind(req, BindSyncs::new()).unwrap_err();

    assert!(matches!(bind(BindRequest::map(obj.clone(), 0, 0x1234, PAGE)), VmError::Unaligned { .. }));
    assert!(matches!(bind(BindRequest::map(obj.clone(), 0, 0x20_0000, 0)), VmError::InvalidArgument(_)));
    assert!(matches!(
        bind(BindRequest::map(obj.clone(), 0, (1 << 48) - PAGE, 2 * PAGE)),
        VmError::OutOfBounds { .. }
    ));
    let overlap = bind(BindRequest::map(obj.clone(), 0, 0x10_1000, 2 * PAGE));
    assert!(matches!(overlap, VmError::Overlap { .. }));
    assert_eq!(overlap.kind(), ErrorKind::Structural);
    assert!(matches!(bind(BindRequest::map(obj.clone(), PAGE, 0x20_0000, 4 * PAGE)), VmError::InvalidArgument(_)));
    assert!(matches!(bind(BindRequest::map(obj.clone(), 0x10, 0x20_0000, PAGE)), VmError::Unaligned { .. }));
    assert!(matches!(
        bind(BindRequest::map(obj.clone(), 0, 0x20_0000, PAGE).with_tiles(0b10)),
        VmError::InvalidArgument(_)
    ));
    assert!(matches!(
        bind(BindRequest::map(obj.clone(), 0, 0x20_0000, PAGE).with_flags(BindFlags::ASYNC)),
        VmError::InvalidArgument(_)
    ));
    assert!(matches!(bind(BindRequest::map_userptr(0x123, 0x20_0000, PAGE)), VmError::Unaligned { .. }));

    assert_eq!(vm.mappings().len(), 1);
    assert_eq!(obj.vma_links().len(), 1);
}

#[test]
fn residency_failure_leaves_tree_untouched_and_fails_out_fence() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::empty());
    let obj = buffer(4, 0x4000_0000);
    obj.set_fail_validate(true);

    let out = Fence::new();
    let err = vm
        .bind(BindRequest::map(obj.clone(), 0, 0x10_0000, 4 * PAGE), BindSyncs::new().signal_to(out.clone()))
        .unwrap_err();
    assert!(matches!(err, VmError::Residency(_)));
    assert_eq!(err.kind(), ErrorKind::Residency);
    assert!(matches!(out.status(), Some(Err(FenceError::Failed(_)))));
    assert!(vm.mappings().is_empty());
    assert!(obj.vma_links().is_empty());
    assert_eq!(fx.sim.submitter.jobs(), 0);

    obj.set_fail_validate(false);
    vm.bind(BindRequest::map(obj.clone(), 0, 0x10_0000, 4 * PAGE), BindSyncs::new())
        .unwrap();
    assert_eq!(obj.validations(), 1);
}

#[test]
fn table_exhaustion_fails_the_bind() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::empty());
    fx.sim.tables.set_budget(Some(0));
    let err = vm
        .bind(BindRequest::map(buffer(1, 0x4000_0000), 0, 0x10_0000, PAGE), BindSyncs::new())
        .unwrap_err();
    assert_eq!(err, VmError::OutOfMemory);
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert!(vm.mappings().is_empty());

    fx.sim.tables.set_budget(None);
    vm.bind(BindRequest::map(buffer(1, 0x4000_0000), 0, 0x10_0000, PAGE), BindSyncs::new())
        .unwrap();
}

#[test]
fn failed_submission_takes_back_committed_entries() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::empty());
    let obj = buffer(4, 0x4000_0000);
    let r = range(0x10_0000, 4 * PAGE);

    fx.sim.submitter.set_fail(true);
    let out = Fence::new();
    let err = vm
        .bind(BindRequest::map(obj.clone(), 0, 0x10_0000, 4 * PAGE), BindSyncs::new().signal_to(out.clone()))
        .unwrap_err();
    assert!(matches!(err, VmError::Submit(_)));
    assert!(matches!(out.status(), Some(Err(FenceError::Failed(_)))));
    assert!(vm.mappings().is_empty());
    assert!(obj.vma_links().is_empty());
    assert_eq!(dma_at(&vm, 0, 0x10_0000), None);
    assert_eq!(vm.live_entries(0, r), 0);

    // the range is free again
    fx.sim.submitter.set_fail(false);
    vm.bind(BindRequest::map(obj.clone(), 0, 0x10_0000, 4 * PAGE), BindSyncs::new())
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(vm.live_entries(0, r), 4);
    vm.unbind(0x10_0000, 4 * PAGE).unwrap().wait().unwrap();
    assert_eq!(vm.live_entries(0, r), 0);
}

#[test]
fn failed_partial_unmap_queues_remainders_for_rebind() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::empty());
    let base = 0x100_0000;
    let obj = buffer(100, 0x4000_0000);
    vm.bind(BindRequest::map(obj.clone(), 0, base, 100 * PAGE), BindSyncs::new())
        .unwrap()
        .wait()
        .unwrap();

    obj.set_fail_validate(true);
    let err = vm.unbind(base + 20 * PAGE, 40 * PAGE).unwrap_err();
    assert!(matches!(err, VmError::Residency(_)));

    // no rollback: the hole stays, the remainders wait for a rebind
    let maps = vm.mappings();
    assert_eq!(maps.len(), 2);
    assert_eq!(maps[0].range(), range(base, 20 * PAGE));
    assert_eq!(maps[1].range(), range(base + 60 * PAGE, 40 * PAGE));
    assert!(maps.iter().all(|v| !v.is_bound()));
    assert_eq!(vm.pending_rebinds(), 2);
    assert_eq!(dma_at(&vm, 0, base + 20 * PAGE), None);
    assert_eq!(dma_at(&vm, 0, base + 70 * PAGE), None);

    obj.set_fail_validate(false);
    vm.rebind_evicted().unwrap().wait().unwrap();
    assert_eq!(vm.pending_rebinds(), 0);
    assert!(vm.mappings().iter().all(|v| v.is_bound()));
    assert_eq!(dma_at(&vm, 0, base + 5 * PAGE), Some(DmaAddress::new(0x4000_0000 + 5 * PAGE)));
    assert_eq!(dma_at(&vm, 0, base + 70 * PAGE), Some(DmaAddress::new(0x4000_0000 + 70 * PAGE)));
    assert_eq!(dma_at(&vm, 0, base + 20 * PAGE), None);
    assert_eq!(vm.live_entries(0, range(base, 100 * PAGE)), 60);
}

#[test]
fn wait_fences_gate_the_operation() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::empty());

    let gate = Fence::new();
    let g = gate.clone();
    let signaler = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        g.signal();
    });
    vm.bind(
        BindRequest::map(buffer(1, 0x4000_0000), 0, 0x10_0000, PAGE),
        BindSyncs::new().wait_on(gate.clone()),
    )
    .unwrap();
    assert!(gate.is_signaled());
    signaler.join().unwrap();

    let err = vm
        .bind(
            BindRequest::map(buffer(1, 0x4000_0000), 0, 0x20_0000, PAGE),
            BindSyncs::new().wait_on(Fence::failed(FenceError::Canceled)),
        )
        .unwrap_err();
    assert_eq!(err, VmError::Fence(FenceError::Canceled));
    assert_eq!(vm.mappings().len(), 1);
}

#[test]
fn bind_fences_are_published_on_the_reservation() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::empty());
    fx.sim.submitter.set_deferred(true);

    let fence = vm
        .bind(BindRequest::map(buffer(1, 0x4000_0000), 0, 0x10_0000, PAGE), BindSyncs::new())
        .unwrap();
    assert!(!fence.is_signaled());
    assert!(!vm.reservation().fences(FenceUsage::Kernel).is_empty());

    assert_eq!(fx.sim.submitter.complete_all(), 1);
    fence.wait_timeout(Duration::from_secs(1)).unwrap();
    assert!(vm.reservation().fences(FenceUsage::Kernel).is_signaled());
}

#[test]
fn batches_run_in_order_and_signal_once() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::empty());
    let a = buffer(2, 0x4000_0000);
    let b = buffer(2, 0x5000_0000);

    let out = Fence::new();
    let outcome = vm
        .submit(
            vec![
                BindRequest::map(a, 0, 0x10_0000, 2 * PAGE),
                BindRequest::map(b.clone(), 0, 0x20_0000, 2 * PAGE).with_flags(BindFlags::READ_ONLY),
                BindRequest::unmap(0x10_0000, 2 * PAGE),
            ],
            BindSyncs::new().signal_to(out.clone()),
        )
        .unwrap();
    assert!(matches!(outcome, BindOutcome::Complete(_)));
    out.wait_timeout(Duration::from_secs(1)).unwrap();

    let maps = vm.mappings();
    assert_eq!(maps.len(), 1);
    assert!(maps[0].read_only());
    assert!(!vm.translate(0, GpuAddress::new(0x20_0000)).unwrap().attrs.writable);

    // one bad request rejects the whole batch
    let err = vm
        .submit(
            vec![
                BindRequest::map(b.clone(), 0, 0x30_0000, PAGE),
                BindRequest::unmap(0x1001, PAGE),
            ],
            BindSyncs::new(),
        )
        .unwrap_err();
    assert!(matches!(err, VmError::Unaligned { .. }));
    assert_eq!(vm.mappings().len(), 1);

    assert!(vm.submit(Vec::new(), BindSyncs::new()).is_err());
}

#[test]
fn unmap_all_drops_every_mapping_of_the_object() {
    let fx = Fixture::new();
    let vm = fx.vm(VmFlags::empty());
    let obj = buffer(2, 0x4000_0000);
    let keep = buffer(1, 0x5000_0000);
    vm.bind(BindRequest::map(obj.clone(), 0, 0x10_0000, 2 * PAGE), BindSyncs::new())
        .unwrap();
    vm.bind(BindRequest::map(obj.clone(), PAGE, 0x40_0000, PAGE), BindSyncs::new())
        .unwrap();
    vm.bind(BindRequest::map(keep, 0, 0x80_0000, PAGE), BindSyncs::new())
        .unwrap();
    assert_eq!(obj.vma_links().len(), 2);

    vm.bind(BindRequest::unmap_all(obj.clone()), BindSyncs::new())
        .unwrap()
        .wait()
        .unwrap();

    assert_eq!(vm.mappings().len(), 1);
    assert!(obj.vma_links().is_empty());
    assert_eq!(dma_at(&vm, 0, 0x40_0000), None);
    assert_eq!(dma_at(&vm, 0, 0x80_0000), Some(DmaAddress::new(0x5000_0000)));
}

#[test]
fn tile_masks_select_page_table_trees() {
    let fx = Fixture::with_config(DeviceConfig {
        tiles: 2,
        ..DeviceConfig::default()
    });
    let vm = fx.vm(VmFlags::empty());
    assert_ne!(vm.root_table_address(0).unwrap(), vm.root_table_address(1).unwrap());
    assert!(vm.root_table_address(2).is_err());

    vm.bind(BindRequest::map(buffer(1, 0x4000_0000), 0, 0x10_0000, PAGE), BindSyncs::new())
        .unwrap();
    vm.bind(
        BindRequest::map(buffer(1, 0x5000_0000), 0, 0x20_0000, PAGE).with_tiles(0b10),
        BindSyncs::new(),
    )
    .unwrap();

    assert!(dma_at(&vm, 0, 0x10_0000).is_some());
    assert!(dma_at(&vm, 1, 0x10_0000).is_some());
    assert!(dma_at(&vm, 0, 0x20_0000).is_none());
    assert_eq!(dma_at(&vm, 1, 0x20_0000), Some(DmaAddress::new(0x5000_0000)));
    assert_eq!(vm.lookup(GpuAddress::new(0x20_0000)).unwrap().tile_present(), 0b10);

    vm.unbind(0x10_0000, PAGE).unwrap();
    let tiles: Vec<_> = fx.sim.tlb.invalidations().iter().map(|(t, _)| *t).collect();
    assert_eq!(tiles, vec![0, 1]);
}

#[derive(Debug, Clone)]
enum Op {
    Map(u64, u64),
    Unmap(u64, u64),
}

fn op() -> impl Strategy<Value = Op> {
    (any::<bool>(), 0u64..32, 1u64..8).prop_map(|(map, slot, pages)| {
        if map { Op::Map(slot, pages) } else { Op::Unmap(slot, pages) }
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn mappings_never_overlap_and_match_page_tables(ops in prop::collection::vec(op(), 1..24)) {
        let fx = Fixture::new();
        let vm = fx.vm(VmFlags::empty());
        let base = 0x100_0000;
        let obj = buffer(64, 0x4000_0000);

        for op in ops {
            match op {
                Op::Map(slot, pages) => {
                    let _ = vm.bind(
                        BindRequest::map(obj.clone(), slot * PAGE, base + slot * PAGE, pages * PAGE),
                        BindSyncs::new(),
                    );
                }
                Op::Unmap(slot, pages) => {
                    vm.unbind(base + slot * PAGE, pages * PAGE).unwrap();
                }
            }
        }

        let maps = vm.mappings();
        for pair in maps.windows(2) {
            prop_assert!(pair[0].end() <= pair[1].start());
        }
        let mapped: u64 = maps.iter().map(|v| v.range().len() / PAGE).sum();
        prop_assert_eq!(vm.live_entries(0, range(base, 64 * PAGE)) as u64, mapped);
        for v in &maps {
            let expect = DmaAddress::new(0x4000_0000 + v.offset());
            prop_assert_eq!(dma_at(&vm, 0, v.start().as_u64()), Some(expect));
        }
    }
}
