//! End-to-end scenarios against the hosted harness: device mappings,
//! allocator stress, fork with copy-on-write, stale-TLB recovery, stack
//! guards and full address-space teardown.

use std::collections::HashSet;

use vanadium_kernel::layout::{PAGE_SIZE, USER_MEMORY_END, USER_MEMORY_START};
use vanadium_kernel::memory::{
    hosted, MemError, MemoryManager, PageFaultCode, VmFlags,
};

const PAGE: u64 = PAGE_SIZE as u64;

fn manager(ram_bytes: usize) -> (&'static hosted::TestPlatform, MemoryManager) {
    let platform = hosted::TestPlatform::new(ram_bytes);
    let mm = MemoryManager::new(platform).unwrap();
    (platform, mm)
}

fn write_fault() -> PageFaultCode {
    PageFaultCode::PROTECTION_VIOLATION
        | PageFaultCode::CAUSED_BY_WRITE
        | PageFaultCode::USER_MODE
}

fn not_present_write() -> PageFaultCode {
    PageFaultCode::CAUSED_BY_WRITE | PageFaultCode::USER_MODE
}

#[test]
fn s1_device_map_unmap_cycle() {
    let (_, mm) = manager(8 * 1024 * 1024);
    let virt = mm
        .kernel_map(0xB8000, PAGE, VmFlags::RW | VmFlags::HARDWARE)
        .unwrap();

    let (pa, fl) = mm.translate(virt, None).unwrap();
    assert_eq!(pa, 0xB8000);
    assert!(fl.contains(VmFlags::HARDWARE | VmFlags::RW | VmFlags::KERNEL));

    mm.kernel_unmap(virt, PAGE).unwrap();
    assert_eq!(mm.translate(virt, None), Err(MemError::NotMapped));
}

#[test]
fn s2_allocator_stress_exhausts_and_recovers() {
    let (_, mm) = manager(2 * 1024 * 1024);
    let snapshot = mm.frames().free_snapshot();
    let total_frames: u64 = snapshot.iter().map(|r| r.len() / PAGE).sum();

    let mut held = Vec::new();
    for _ in 0..total_frames {
        held.push(mm.alloc_frames(1).unwrap());
    }
    // call number total_frames + 1 fails
    assert_eq!(mm.alloc_frames(1), Err(MemError::OutOfMemory));

    for frame in held.into_iter().rev() {
        mm.release_frames(frame, 1);
    }
    assert_eq!(mm.frames().free_snapshot(), snapshot);
}

#[test]
fn s3_fork_with_cow() {
    let (platform, mm) = manager(16 * 1024 * 1024);
    let parent = mm.create_process_memory().unwrap();
    let va = USER_MEMORY_START + 0x40000;

    let frame = mm.alloc_frames(1).unwrap();
    mm.user_map_direct(frame, va, PAGE, VmFlags::USER | VmFlags::RW, &parent)
        .unwrap();
    hosted::frame_view(frame).fill(0x11);

    let child = mm.clone_process_memory(&parent).unwrap();
    assert_eq!(mm.frames().refcount(frame), Some(2));

    // parent writes: fault, private copy, parent sees 0x22
    platform.set_current_space(Some(parent.clone()));
    mm.handle_page_fault(va, write_fault(), 0x1000);
    assert!(platform.take_faults().is_empty());
    let (parent_pa, parent_fl) = mm.translate(va, Some(&parent)).unwrap();
    assert_ne!(parent_pa, frame);
    assert!(parent_fl.contains(VmFlags::RW));
    hosted::frame_view(parent_pa)[0] = 0x22;

    // child still sees 0x11 through the original frame
    let (child_pa, _) = mm.translate(va, Some(&child)).unwrap();
    assert_eq!(child_pa, frame);
    assert_eq!(hosted::frame_view(child_pa)[0], 0x11);
    assert_eq!(hosted::frame_view(parent_pa)[0], 0x22);

    // refcounts: old frame kept by the child, new frame by the parent
    assert_eq!(mm.frames().refcount(frame), Some(1));
    assert_eq!(mm.frames().refcount(parent_pa), Some(1));

    mm.destroy_process_memory(&child).unwrap();
    assert_eq!(mm.frames().refcount(frame), Some(0));
    mm.destroy_process_memory(&parent).unwrap();
    assert_eq!(mm.frames().refcount(parent_pa), Some(0));
}

#[test]
fn s4_stale_tlb_after_unmap_is_fatal() {
    let (platform, mm) = manager(8 * 1024 * 1024);
    let space = mm.create_process_memory().unwrap();
    let va = USER_MEMORY_START;
    let frame = mm.alloc_frames(1).unwrap();
    mm.user_map_direct(frame, va, PAGE, VmFlags::USER | VmFlags::RW, &space)
        .unwrap();

    // T1 unmaps; T2 races on a stale translation and faults not-present.
    mm.user_unmap(va, PAGE, &space).unwrap();
    platform.set_current_space(Some(space.clone()));
    mm.handle_page_fault(va + 0x8, not_present_write(), 0x2000);

    let faults = platform.take_faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].fault_addr, va + 0x8);
    assert_eq!(faults[0].inst_addr, 0x2000);
    mm.destroy_process_memory(&space).unwrap();
}

#[test]
fn s4b_stale_tlb_with_live_mapping_recovers() {
    let (platform, mm) = manager(8 * 1024 * 1024);
    let space = mm.create_process_memory().unwrap();
    let va = USER_MEMORY_START;
    let frame = mm.alloc_frames(1).unwrap();
    mm.user_map_direct(frame, va, PAGE, VmFlags::USER | VmFlags::RW, &space)
        .unwrap();

    // another core installed the mapping; this core's fault is stale
    platform.set_current_space(Some(space.clone()));
    mm.handle_page_fault(va, not_present_write(), 0x3000);
    assert!(platform.take_faults().is_empty());
    mm.destroy_process_memory(&space).unwrap();
}

#[test]
fn s5_stack_guard_faults_below_the_stack() {
    let (platform, mm) = manager(8 * 1024 * 1024);
    let space = mm.create_process_memory().unwrap();

    let top = mm.map_stack(16 * 1024, false, Some(&space)).unwrap();
    assert_eq!(top, USER_MEMORY_END);

    // every byte of the 16 KiB body is reachable
    for offset in [1, PAGE, 2 * PAGE, 16 * 1024] {
        assert!(mm.translate(top - offset, Some(&space)).is_ok());
    }
    // one byte below the body is the guard page
    assert_eq!(
        mm.translate(top - 16 * 1024 - 1, Some(&space)),
        Err(MemError::NotMapped)
    );
    platform.set_current_space(Some(space.clone()));
    mm.handle_page_fault(top - 16 * 1024 - 1, not_present_write(), 0x4000);
    assert_eq!(platform.take_faults().len(), 1);

    mm.unmap_stack(top, 16 * 1024, false, Some(&space)).unwrap();
    mm.destroy_process_memory(&space).unwrap();
}

#[test]
fn s6_teardown_releases_everything() {
    // sparse mappings cost up to three table frames per page
    let (_, mm) = manager(32 * 1024 * 1024);
    let free_before = mm.frames().free_bytes();
    let space = mm.create_process_memory().unwrap();

    // 1024 scattered user pages
    let mut rng: u64 = 0xA076_1D64_78BD_642F;
    let mut taken = HashSet::new();
    let span_pages = (USER_MEMORY_END - USER_MEMORY_START) / PAGE;
    while taken.len() < 1024 {
        rng ^= rng << 13;
        rng ^= rng >> 7;
        rng ^= rng << 17;
        let va = USER_MEMORY_START + (rng % span_pages) * PAGE;
        if !taken.insert(va) {
            continue;
        }
        let frame = mm.alloc_frames(1).unwrap();
        mm.user_map_direct(frame, va, PAGE, VmFlags::USER | VmFlags::RW, &space)
            .unwrap();
    }
    assert!(mm.frames().free_bytes() < free_before);

    mm.destroy_process_memory(&space).unwrap();
    assert_eq!(mm.frames().free_bytes(), free_before);
}

#[test]
fn p4_kernel_alloc_round_trip_preserves_pools() {
    let (_, mm) = manager(8 * 1024 * 1024);
    let frames_before = mm.frames().free_snapshot();

    let virt = mm.kernel_alloc(16 * PAGE, VmFlags::RW).unwrap();
    mm.kernel_free(virt, 16 * PAGE).unwrap();

    assert_eq!(mm.frames().free_snapshot(), frames_before);
    // the freed window is taken again from the same spot
    assert_eq!(mm.kernel_alloc(16 * PAGE, VmFlags::RW).unwrap(), virt);
}

#[test]
fn p5_clone_destroy_leaves_parent_intact() {
    let (platform, mm) = manager(16 * 1024 * 1024);
    let parent = mm.create_process_memory().unwrap();
    let va = USER_MEMORY_START;
    let frame = mm.alloc_frames(1).unwrap();
    mm.user_map_direct(frame, va, PAGE, VmFlags::USER | VmFlags::RW, &parent)
        .unwrap();

    let child = mm.clone_process_memory(&parent).unwrap();
    mm.destroy_process_memory(&child).unwrap();

    assert_eq!(mm.frames().refcount(frame), Some(1));
    // parent was downgraded during the clone; the write-back resolves COW
    platform.set_current_space(Some(parent.clone()));
    mm.handle_page_fault(va, write_fault(), 0x5000);
    assert!(platform.take_faults().is_empty());
    let (pa, fl) = mm.translate(va, Some(&parent)).unwrap();
    assert_eq!(pa, frame);
    assert!(fl.contains(VmFlags::RW));
    mm.destroy_process_memory(&parent).unwrap();
}

#[test]
fn p7_mapping_broadcasts_invalidations() {
    let (platform, mm) = manager(8 * 1024 * 1024);
    let before = platform.broadcasts().len();
    let virt = mm.kernel_alloc(4 * PAGE, VmFlags::RW).unwrap();
    let sent = platform.broadcasts();
    assert!(sent.len() >= before + 4);
    for i in 0..4 {
        assert!(sent[before..].contains(&(virt + i * PAGE)));
    }

    let before = platform.broadcasts().len();
    mm.kernel_free(virt, 4 * PAGE).unwrap();
    let sent = platform.broadcasts();
    assert!(sent.len() >= before + 4);
}

#[test]
fn p8_double_release_is_fatal() {
    let (_, mm) = manager(4 * 1024 * 1024);
    let frame = mm.alloc_frames(1).unwrap();
    mm.release_frames(frame, 1);
    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        mm.release_frames(frame, 1);
    }));
    assert!(caught.is_err());
}
