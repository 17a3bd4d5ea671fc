// memory/space.rs — per-process address spaces.
//
// An address space owns its PML4 frame and its user free-page window.
// The two shared top-level slots (linear window, kernel tables) are copied
// verbatim from the kernel root at creation and never owned by a process.
//
// clone() deep-copies the user half with copy-on-write: intermediate
// tables are fresh, leaf frames are shared with their refcount raised,
// and writable leaves are downgraded to read-only+COW on BOTH sides.
// Lock order is source first, then the (still invisible) destination.

use alloc::sync::Arc;
use spin::mutex::{TicketMutex, TicketMutexGuard};
use x86_64::structures::paging::PageTableFlags as PtF;

use crate::layout::{USER_MEMORY_END, USER_MEMORY_START};
use crate::log::try_get_logger;

use super::paging::{VmCtx, COW_BIT, HW_BIT};
use super::range::RangeList;
use super::{linear, tlb, MemError, VmResult};

/// PML4 slots covering user virtual memory (the entire lower half).
const USER_SLOTS: core::ops::Range<usize> = 0..256;

pub(crate) struct SpaceInner {
    /// Physical address of the PML4 frame; 0 once destroyed.
    pub pml4: u64,
    /// Free-page window owned by this space: the user window for process
    /// spaces, the kernel window for the kernel singleton.
    pub pages: RangeList,
}

pub struct AddressSpace {
    inner: TicketMutex<SpaceInner>,
    kernel: bool,
}

impl AddressSpace {
    /// The kernel singleton: shared root plus the kernel free-page window.
    pub(crate) fn new_kernel(pml4: u64, pages: RangeList) -> Self {
        AddressSpace {
            inner: TicketMutex::new(SpaceInner { pml4, pages }),
            kernel: true,
        }
    }

    pub(crate) fn lock(&self) -> TicketMutexGuard<'_, SpaceInner> {
        self.inner.lock()
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// Root table physical address, as loaded into CR3.
    pub fn root_phys(&self) -> u64 {
        self.inner.lock().pml4
    }

    /// Switch the running core onto this address space.
    ///
    /// # Safety
    /// The kernel half must be populated (true for every space built by
    /// this module) and the space must not be destroyed while resident.
    pub unsafe fn install(&self) {
        crate::arch::load_root(self.root_phys());
    }
}

fn copy_shared_slots(src_root: u64, dst_root: u64) {
    let src = unsafe { linear::table_mut(src_root) };
    let dst = unsafe { linear::table_mut(dst_root) };
    for slot in [crate::layout::LINEAR_SLOT, crate::layout::KERNEL_SLOT] {
        if !src[slot].is_unused() {
            dst[slot].set_addr(src[slot].addr(), src[slot].flags());
        }
    }
}

/// Fresh address space: empty user half, shared kernel half, full user
/// page window.
pub(crate) fn create(ctx: &VmCtx<'_>, kernel_root: u64) -> VmResult<Arc<AddressSpace>> {
    let pml4 = ctx.frames.alloc_frames(1)?;
    linear::zero_frame(pml4);
    copy_shared_slots(kernel_root, pml4);
    Ok(Arc::new(AddressSpace {
        inner: TicketMutex::new(SpaceInner {
            pml4,
            pages: RangeList::with_span(USER_MEMORY_START, USER_MEMORY_END - USER_MEMORY_START),
        }),
        kernel: false,
    }))
}

fn new_table(ctx: &VmCtx<'_>) -> VmResult<u64> {
    let frame = ctx.frames.alloc_frames(1)?;
    linear::zero_frame(frame);
    Ok(frame)
}

/// Deep-copy the user half of `src` into `dst`, sharing leaf frames
/// copy-on-write. On error the destination holds only fully-accounted
/// entries, so the caller can destroy it to unwind.
fn clone_user_half(ctx: &VmCtx<'_>, src_root: u64, dst_root: u64) -> VmResult<()> {
    let src_l4 = unsafe { linear::table_mut(src_root) };
    let dst_l4 = unsafe { linear::table_mut(dst_root) };

    for i4 in USER_SLOTS {
        let se4 = &src_l4[i4];
        if se4.is_unused() {
            continue;
        }
        let dl3p = new_table(ctx)?;
        dst_l4[i4].set_addr(x86_64::PhysAddr::new(dl3p), se4.flags());
        let src_l3 = unsafe { linear::table_mut(se4.addr().as_u64()) };
        let dst_l3 = unsafe { linear::table_mut(dl3p) };

        for i3 in 0..512 {
            let se3 = &src_l3[i3];
            if se3.is_unused() {
                continue;
            }
            if se3.flags().contains(PtF::HUGE_PAGE) {
                panic!("huge leaf in user half at PML3[{}][{}]", i4, i3);
            }
            let dl2p = new_table(ctx)?;
            dst_l3[i3].set_addr(x86_64::PhysAddr::new(dl2p), se3.flags());
            let src_l2 = unsafe { linear::table_mut(se3.addr().as_u64()) };
            let dst_l2 = unsafe { linear::table_mut(dl2p) };

            for i2 in 0..512 {
                let se2 = &src_l2[i2];
                if se2.is_unused() {
                    continue;
                }
                if se2.flags().contains(PtF::HUGE_PAGE) {
                    panic!("huge leaf in user half at PML2[{}][{}][{}]", i4, i3, i2);
                }
                let dl1p = new_table(ctx)?;
                dst_l2[i2].set_addr(x86_64::PhysAddr::new(dl1p), se2.flags());
                let src_l1 = unsafe { linear::table_mut(se2.addr().as_u64()) };
                let dst_l1 = unsafe { linear::table_mut(dl1p) };

                for i1 in 0..512 {
                    let se1 = &mut src_l1[i1];
                    if se1.is_unused() {
                        continue;
                    }
                    let flags = se1.flags();
                    if flags.contains(HW_BIT) {
                        // device mapping: byte-for-byte, no refcount
                        dst_l1[i1].set_addr(se1.addr(), flags);
                        continue;
                    }
                    ctx.frames.retain_frame(se1.addr().as_u64())?;
                    if flags.contains(PtF::WRITABLE) {
                        let downgraded = (flags & !PtF::WRITABLE) | COW_BIT;
                        se1.set_flags(downgraded);
                        dst_l1[i1].set_addr(se1.addr(), downgraded);
                    } else {
                        // read-only, possibly already COW-shared
                        dst_l1[i1].set_addr(se1.addr(), flags);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Clone `src` for a fork: shared kernel half, COW user half, copied user
/// page window. Fully unwinds on any failure.
pub(crate) fn clone(ctx: &VmCtx<'_>, src: &AddressSpace) -> VmResult<Arc<AddressSpace>> {
    let src_inner = src.inner.lock();
    if src_inner.pml4 == 0 {
        return Err(MemError::InvalidArgument);
    }

    let dst_pml4 = ctx.frames.alloc_frames(1)?;
    linear::zero_frame(dst_pml4);
    copy_shared_slots(src_inner.pml4, dst_pml4);

    if let Err(err) = clone_user_half(ctx, src_inner.pml4, dst_pml4) {
        // Drop every refcount the partial copy took and free its tables.
        // Source entries already downgraded stay COW: their counts are
        // back to one, so the next write self-resolves.
        destroy_tree(ctx, dst_pml4);
        ctx.frames.release_frames(dst_pml4, 1);
        tlb::flush_current();
        if let Some(l) = try_get_logger() {
            l.log("[VM] address-space clone unwound");
        }
        return Err(err);
    }

    let pages = src_inner.pages.clone();
    // Downgraded source entries must stop hitting stale writable TLB
    // entries on this core.
    tlb::flush_current();

    Ok(Arc::new(AddressSpace {
        inner: TicketMutex::new(SpaceInner { pml4: dst_pml4, pages }),
        kernel: false,
    }))
}

/// Release every user-half frame reference and table of `root`.
fn destroy_tree(ctx: &VmCtx<'_>, root: u64) {
    let l4 = unsafe { linear::table_mut(root) };
    for i4 in USER_SLOTS {
        let e4 = &mut l4[i4];
        if e4.is_unused() {
            continue;
        }
        let l3p = e4.addr().as_u64();
        let l3 = unsafe { linear::table_mut(l3p) };
        for i3 in 0..512 {
            let e3 = &l3[i3];
            if e3.is_unused() {
                continue;
            }
            let l2p = e3.addr().as_u64();
            let l2 = unsafe { linear::table_mut(l2p) };
            for i2 in 0..512 {
                let e2 = &l2[i2];
                if e2.is_unused() {
                    continue;
                }
                let l1p = e2.addr().as_u64();
                let l1 = unsafe { linear::table_mut(l1p) };
                for i1 in 0..512 {
                    let e1 = &l1[i1];
                    if e1.is_unused() || e1.flags().contains(HW_BIT) {
                        continue;
                    }
                    ctx.frames.drop_frame(e1.addr().as_u64());
                }
                ctx.frames.release_frames(l1p, 1);
            }
            ctx.frames.release_frames(l2p, 1);
        }
        ctx.frames.release_frames(l3p, 1);
        e4.set_unused();
    }
}

/// Tear a process space down: every user frame loses one owner (freed at
/// zero), every table frame and the root return to the pool.
pub(crate) fn destroy(ctx: &VmCtx<'_>, space: &AddressSpace) -> VmResult<()> {
    if space.kernel {
        return Err(MemError::Unauthorized);
    }
    let mut inner = space.inner.lock();
    if inner.pml4 == 0 {
        return Err(MemError::InvalidArgument);
    }
    let root = inner.pml4;
    inner.pml4 = 0;
    destroy_tree(ctx, root);
    ctx.frames.release_frames(root, 1);
    inner.pages.clear();
    Ok(())
}
