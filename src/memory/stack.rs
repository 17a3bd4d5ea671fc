//! Guard-paged stack construction.
//!
//! A stack reservation is `pages + 1` contiguous pages taken from the top
//! of the owning free-page window; the lowest page stays unmapped so any
//! overflow faults instead of silently corrupting the neighbour. The
//! returned address is the exclusive top.

use crate::layout::{align_up, PAGE_SIZE};

use super::paging::{self, FrameDisposition, VmCtx, VmFlags};
use super::space::AddressSpace;
use super::{MemError, VmResult};

const PAGE: u64 = PAGE_SIZE as u64;

fn stack_flags(is_kernel: bool) -> VmFlags {
    if is_kernel {
        VmFlags::KERNEL | VmFlags::RW
    } else {
        VmFlags::USER | VmFlags::RW
    }
}

/// Build a stack of at least `size` bytes in `space` (the kernel space for
/// kernel stacks). Returns the top-of-stack address, exclusive.
pub(crate) fn map_stack(
    ctx: &VmCtx<'_>,
    space: &AddressSpace,
    size: u64,
    is_kernel: bool,
) -> VmResult<u64> {
    if size == 0 {
        return Err(MemError::InvalidArgument);
    }
    let pages = align_up(size, PAGE) / PAGE;
    let reserve = (pages + 1) * PAGE;

    let mut inner = space.lock();
    if inner.pml4 == 0 {
        return Err(MemError::InvalidArgument);
    }
    let base = inner
        .pages
        .take_from_top(reserve)
        .ok_or(MemError::OutOfMemory)?;
    let stack_base = base + PAGE; // bottom page is the guard

    for i in 0..pages {
        let virt = stack_base + i * PAGE;
        let frame = match ctx.frames.alloc_frames(1) {
            Ok(f) => f,
            Err(err) => {
                unwind(ctx, &mut inner, base, stack_base, i, reserve);
                return Err(err);
            }
        };
        if let Err(err) = paging::map(ctx, inner.pml4, virt, frame, 1, stack_flags(is_kernel)) {
            ctx.frames.release_frames(frame, 1);
            unwind(ctx, &mut inner, base, stack_base, i, reserve);
            return Err(err);
        }
    }

    Ok(base + reserve)
}

fn unwind(
    ctx: &VmCtx<'_>,
    inner: &mut super::space::SpaceInner,
    base: u64,
    stack_base: u64,
    mapped: u64,
    reserve: u64,
) {
    if mapped > 0 {
        paging::unmap(ctx, inner.pml4, stack_base, mapped, FrameDisposition::Drop)
            .expect("stack unwind: prefix no longer mapped");
    }
    inner.pages.add(base, reserve);
}

/// Release a stack built by [`map_stack`]: frames, mappings and the whole
/// reserved window including the guard page.
pub(crate) fn unmap_stack(
    ctx: &VmCtx<'_>,
    space: &AddressSpace,
    top: u64,
    size: u64,
    is_kernel: bool,
) -> VmResult<()> {
    if size == 0 {
        return Err(MemError::InvalidArgument);
    }
    let pages = align_up(size, PAGE) / PAGE;
    let reserve = (pages + 1) * PAGE;
    let base = top.checked_sub(reserve).ok_or(MemError::InvalidArgument)?;
    let stack_base = base + PAGE;

    let mut inner = space.lock();
    if inner.pml4 == 0 {
        return Err(MemError::InvalidArgument);
    }
    paging::unmap(ctx, inner.pml4, stack_base, pages, FrameDisposition::Drop)?;
    inner.pages.add(base, reserve);
    Ok(())
}
