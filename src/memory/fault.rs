// memory/fault.rs — page-fault classification and repair.
//
// Three outcomes:
//  - stale TLB: a not-present fault whose leaf is in fact present
//    (another core installed it first); drop the local translation
//  - copy-on-write: a write protection fault on a COW leaf; give the
//    writer its own frame, or take the sole-owner fast path
//  - fatal: everything else; record {fault address, RIP} against the
//    thread and raise its segmentation signal, then return so the
//    scheduler can take it off-CPU

use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::structures::paging::PageTableFlags as PtF;

use crate::arch;
use crate::log::try_get_logger;
use crate::platform::FaultRecord;

use super::paging::{self, VmCtx, COW_BIT, HW_BIT};
use super::space::AddressSpace;
use super::{linear, tlb, MemError, VmResult};

pub(crate) fn handle_page_fault(
    ctx: &VmCtx<'_>,
    fault_addr: u64,
    code: PageFaultErrorCode,
    inst_addr: u64,
) {
    let Some(space) = ctx.platform.current_address_space() else {
        panic!(
            "page fault at {:#x} (rip {:#x}) before the scheduler is running",
            fault_addr, inst_addr
        );
    };

    let page = crate::layout::align_down(fault_addr, crate::layout::PAGE_SIZE as u64);
    let resolution = classify_and_repair(ctx, &space, page, code);

    if resolution.is_err() {
        if let Some(l) = try_get_logger() {
            l.log("[PF] fatal fault, raising segmentation signal");
        }
        ctx.platform.report_page_fault(FaultRecord {
            fault_addr,
            inst_addr,
        });
    }
}

fn classify_and_repair(
    ctx: &VmCtx<'_>,
    space: &AddressSpace,
    page: u64,
    code: PageFaultErrorCode,
) -> VmResult<()> {
    let root = space.root_phys();
    if root == 0 {
        return Err(MemError::NotMapped);
    }
    let (_, flags) = paging::translate(&ctx.widths, root, page)?;

    if !code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
        // Not-present fault, yet the walk sees the leaf: another core won
        // the race and the shoot-down has not landed here. Retry.
        arch::invlpg(page);
        return Ok(());
    }

    if code.contains(PageFaultErrorCode::CAUSED_BY_WRITE)
        && flags.contains(paging::VmFlags::COW)
    {
        return resolve_cow(ctx, space, page);
    }

    // Write to read-only non-COW, instruction fetch from NX, user access
    // to a supervisor page: nothing to repair.
    Err(MemError::InvalidArgument)
}

/// Give the faulting address space a private, writable copy of the COW
/// page. The replacement frame is allocated before any lock is taken so
/// failure never leaves half-adjusted counts; the sole-owner path hands
/// it straight back.
fn resolve_cow(ctx: &VmCtx<'_>, space: &AddressSpace, page: u64) -> VmResult<()> {
    let replacement = ctx.frames.alloc_frames(1)?;

    let inner = space.lock();
    let walked = paging::with_leaf(inner.pml4, page, |entry| {
        let flags = entry.flags();
        if !flags.contains(COW_BIT) {
            // Resolved by a sibling thread between fault and lock.
            return false;
        }
        debug_assert!(!flags.contains(HW_BIT));
        let frame = entry.addr().as_u64();
        let upgraded = (flags & !COW_BIT) | PtF::WRITABLE;

        if ctx.frames.refcount(frame) == Some(1) {
            // Sole owner: the share collapsed; flip the protection.
            entry.set_flags(upgraded);
            false
        } else {
            ctx.frames.cow_unshare(frame);
            linear::copy_frame(frame, replacement);
            entry.set_addr(x86_64::PhysAddr::new(replacement), upgraded);
            true
        }
    });

    let used_replacement = match walked {
        Ok(used) => used,
        Err(err) => {
            drop(inner);
            ctx.frames.release_frames(replacement, 1);
            return Err(err);
        }
    };

    tlb::invalidate(ctx.platform, page);
    drop(inner);

    if !used_replacement {
        ctx.frames.release_frames(replacement, 1);
    }
    Ok(())
}
