// memory/paging.rs — 4-level walker and mapper.
//
// Features
//  - map/unmap/translate/is_mapped on an arbitrary PML4 root
//  - intermediate tables allocated zeroed on demand, freed again by an
//    empty-table cascade on unmap; the two shared top-level slots are
//    exempt since every address space references those subtrees
//  - request flags translated to hardware bits in one place; software
//    bits 9/10 carry the copy-on-write and hardware-mapping markers
//  - per-page local TLB invalidate plus shoot-down broadcast after every
//    entry mutation
//  - a failed multi-page map unwinds the already-written prefix before
//    returning, so no partial range is ever observable
//
// All table memory is reached through the linear window; the caller holds
// the owning address-space lock for the duration of a call.

use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::PageTableFlags as PtF;
use x86_64::PhysAddr;

use crate::layout::{is_page_aligned, KERNEL_SLOT, LINEAR_SLOT, PAGE_SIZE};
use crate::platform::Platform;

use super::addr::CpuWidths;
use super::frame::FrameAllocator;
use super::{linear, tlb, MemError, VmResult};

const PAGE: u64 = PAGE_SIZE as u64;

// ───────────────────────────────────────────────────────────────────────────────
// Request flags & hardware translation
// ───────────────────────────────────────────────────────────────────────────────

bitflags::bitflags! {
    /// Mapping request flags, independent of the hardware encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        /// Supervisor-only, global translation.
        const KERNEL          = 1 << 0;
        /// Reachable from ring 3.
        const USER            = 1 << 1;
        /// Writable; absent means read-only.
        const RW              = 1 << 2;
        /// Executable; absent sets no-execute.
        const EXEC            = 1 << 3;
        const CACHE_DISABLED  = 1 << 4;
        const WRITE_COMBINING = 1 << 5;
        /// Device memory: uncached, and unmap never touches refcounts.
        const HARDWARE        = 1 << 6;
        /// Copy-on-write share; the entry is kept read-only.
        const COW             = 1 << 7;
    }
}

/// Software PTE bit marking a copy-on-write share.
pub(crate) const COW_BIT: PtF = PtF::BIT_9;
/// Software PTE bit marking a device mapping (refcounts not involved).
pub(crate) const HW_BIT: PtF = PtF::BIT_10;
/// Bit 7 selects the PAT on a 4 KiB leaf; slot 4 is programmed to
/// write-combining at boot ({PAT=1, PCD=0, PWT=0}).
const PAT_LEAF: PtF = PtF::HUGE_PAGE;

pub(crate) fn to_hw_flags(flags: VmFlags) -> PtF {
    let mut hw = PtF::PRESENT;
    if flags.contains(VmFlags::RW) && !flags.contains(VmFlags::COW) {
        hw |= PtF::WRITABLE;
    }
    if flags.contains(VmFlags::USER) {
        hw |= PtF::USER_ACCESSIBLE;
    }
    if flags.contains(VmFlags::KERNEL) {
        hw |= PtF::GLOBAL;
    }
    if !flags.contains(VmFlags::EXEC) {
        hw |= PtF::NO_EXECUTE;
    }
    if flags.contains(VmFlags::CACHE_DISABLED) {
        hw |= PtF::NO_CACHE;
    }
    if flags.contains(VmFlags::WRITE_COMBINING) {
        hw |= PAT_LEAF;
    }
    if flags.contains(VmFlags::HARDWARE) {
        hw |= PtF::NO_CACHE | HW_BIT;
    }
    if flags.contains(VmFlags::COW) {
        hw |= COW_BIT;
    }
    hw
}

pub(crate) fn decode_flags(hw: PtF) -> VmFlags {
    let mut f = VmFlags::empty();
    if hw.contains(PtF::USER_ACCESSIBLE) {
        f |= VmFlags::USER;
    } else {
        f |= VmFlags::KERNEL;
    }
    if hw.contains(PtF::WRITABLE) {
        f |= VmFlags::RW;
    }
    if !hw.contains(PtF::NO_EXECUTE) {
        f |= VmFlags::EXEC;
    }
    if hw.contains(HW_BIT) {
        f |= VmFlags::HARDWARE;
    } else if hw.contains(PtF::NO_CACHE) {
        f |= VmFlags::CACHE_DISABLED;
    }
    if hw.contains(PAT_LEAF) {
        f |= VmFlags::WRITE_COMBINING;
    }
    if hw.contains(COW_BIT) {
        f |= VmFlags::COW;
    }
    f
}

// ───────────────────────────────────────────────────────────────────────────────
// Walk context & index arithmetic
// ───────────────────────────────────────────────────────────────────────────────

/// Everything a walk needs besides the root: the frame allocator for
/// intermediate tables and the platform for shoot-down broadcasts.
pub(crate) struct VmCtx<'a> {
    pub frames: &'a FrameAllocator,
    pub platform: &'a dyn Platform,
    pub widths: CpuWidths,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// Every page in the range must be present.
    All,
    /// Any present page satisfies the query.
    Any,
}

/// What `unmap` does with the refcount of each non-hardware leaf frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameDisposition {
    /// Drop one owner; the last owner's drop frees the frame.
    Drop,
    /// Leave counts alone (map-failure unwind; the caller still owns the
    /// frames it was trying to install).
    Keep,
}

#[inline]
fn l4_idx(v: u64) -> usize {
    ((v >> 39) & 0x1ff) as usize
}
#[inline]
fn l3_idx(v: u64) -> usize {
    ((v >> 30) & 0x1ff) as usize
}
#[inline]
fn l2_idx(v: u64) -> usize {
    ((v >> 21) & 0x1ff) as usize
}
#[inline]
fn l1_idx(v: u64) -> usize {
    ((v >> 12) & 0x1ff) as usize
}

/// First address past the `shift`-sized block containing `v`; saturates
/// instead of wrapping at the top of the space.
#[inline]
fn next_boundary(v: u64, shift: u32) -> u64 {
    match ((v >> shift) + 1).checked_shl(shift) {
        Some(0) | None => u64::MAX,
        Some(b) => b,
    }
}

fn table_is_empty(table: &x86_64::structures::paging::PageTable) -> bool {
    table.iter().all(PageTableEntry::is_unused)
}

fn validate_range(widths: &CpuWidths, virt: u64, n: u64) -> VmResult<u64> {
    if n == 0 || !is_page_aligned(virt) {
        return Err(MemError::InvalidArgument);
    }
    let len = n.checked_mul(PAGE).ok_or(MemError::InvalidArgument)?;
    widths.check_virt(virt)?;
    // The range must not cross the canonical hole or wrap.
    let last = virt.checked_add(len - PAGE).ok_or(MemError::InvalidArgument)?;
    widths.check_virt(last)?;
    Ok(len)
}

// ───────────────────────────────────────────────────────────────────────────────
// Queries
// ───────────────────────────────────────────────────────────────────────────────

/// Walk `[virt, virt + n·4 KiB)`. Absent intermediate tables skip their
/// whole subtree, so sparse queries stay cheap.
pub(crate) fn is_mapped(root: u64, virt: u64, n: u64, mode: CheckMode) -> bool {
    let end = virt + n * PAGE;
    let all = mode == CheckMode::All;
    let mut v = virt;
    while v < end {
        let l4 = unsafe { linear::table_mut(root) };
        let l4e = &l4[l4_idx(v)];
        if l4e.is_unused() {
            if all {
                return false;
            }
            v = next_boundary(v, 39);
            continue;
        }
        let l3 = unsafe { linear::table_mut(l4e.addr().as_u64()) };
        let l3e = &l3[l3_idx(v)];
        if l3e.is_unused() {
            if all {
                return false;
            }
            v = next_boundary(v, 30);
            continue;
        }
        if l3e.flags().contains(PtF::HUGE_PAGE) {
            if !all {
                return true;
            }
            v = next_boundary(v, 30);
            continue;
        }
        let l2 = unsafe { linear::table_mut(l3e.addr().as_u64()) };
        let l2e = &l2[l2_idx(v)];
        if l2e.is_unused() {
            if all {
                return false;
            }
            v = next_boundary(v, 21);
            continue;
        }
        if l2e.flags().contains(PtF::HUGE_PAGE) {
            if !all {
                return true;
            }
            v = next_boundary(v, 21);
            continue;
        }
        let l1 = unsafe { linear::table_mut(l2e.addr().as_u64()) };
        if l1[l1_idx(v)].is_unused() {
            if all {
                return false;
            }
        } else if !all {
            return true;
        }
        v += PAGE;
    }
    all
}

/// Resolve `virt` to its physical address and decoded flags.
pub(crate) fn translate(widths: &CpuWidths, root: u64, virt: u64) -> VmResult<(u64, VmFlags)> {
    widths.check_virt(virt)?;
    let l4 = unsafe { linear::table_mut(root) };
    let l4e = &l4[l4_idx(virt)];
    if l4e.is_unused() {
        return Err(MemError::NotMapped);
    }
    let l3 = unsafe { linear::table_mut(l4e.addr().as_u64()) };
    let l3e = &l3[l3_idx(virt)];
    if l3e.is_unused() {
        return Err(MemError::NotMapped);
    }
    if l3e.flags().contains(PtF::HUGE_PAGE) {
        let base = l3e.addr().as_u64();
        return Ok((
            base + (virt & ((1 << 30) - 1)),
            decode_flags(l3e.flags() & !PtF::HUGE_PAGE),
        ));
    }
    let l2 = unsafe { linear::table_mut(l3e.addr().as_u64()) };
    let l2e = &l2[l2_idx(virt)];
    if l2e.is_unused() {
        return Err(MemError::NotMapped);
    }
    if l2e.flags().contains(PtF::HUGE_PAGE) {
        let base = l2e.addr().as_u64();
        return Ok((
            base + (virt & ((1 << 21) - 1)),
            decode_flags(l2e.flags() & !PtF::HUGE_PAGE),
        ));
    }
    let l1 = unsafe { linear::table_mut(l2e.addr().as_u64()) };
    let l1e = &l1[l1_idx(virt)];
    if l1e.is_unused() {
        return Err(MemError::NotMapped);
    }
    Ok((
        l1e.addr().as_u64() + (virt & (PAGE - 1)),
        decode_flags(l1e.flags()),
    ))
}

/// Run `f` on the live PML1 entry for `virt` (COW resolution). The chain
/// of tables must exist.
pub(crate) fn with_leaf<R>(
    root: u64,
    virt: u64,
    f: impl FnOnce(&mut PageTableEntry) -> R,
) -> VmResult<R> {
    let l4 = unsafe { linear::table_mut(root) };
    let l4e = &l4[l4_idx(virt)];
    if l4e.is_unused() {
        return Err(MemError::NotMapped);
    }
    let l3 = unsafe { linear::table_mut(l4e.addr().as_u64()) };
    let l3e = &l3[l3_idx(virt)];
    if l3e.is_unused() || l3e.flags().contains(PtF::HUGE_PAGE) {
        return Err(MemError::NotMapped);
    }
    let l2 = unsafe { linear::table_mut(l3e.addr().as_u64()) };
    let l2e = &l2[l2_idx(virt)];
    if l2e.is_unused() || l2e.flags().contains(PtF::HUGE_PAGE) {
        return Err(MemError::NotMapped);
    }
    let l1 = unsafe { linear::table_mut(l2e.addr().as_u64()) };
    Ok(f(&mut l1[l1_idx(virt)]))
}

// ───────────────────────────────────────────────────────────────────────────────
// Mutation
// ───────────────────────────────────────────────────────────────────────────────

fn ensure_table(ctx: &VmCtx<'_>, entry: &mut PageTableEntry, user: bool) -> VmResult<u64> {
    if entry.is_unused() {
        let frame = ctx.frames.alloc_frames(1)?;
        linear::zero_frame(frame);
        let mut flags = PtF::PRESENT | PtF::WRITABLE;
        if user {
            flags |= PtF::USER_ACCESSIBLE;
        }
        entry.set_addr(PhysAddr::new(frame), flags);
        Ok(frame)
    } else if entry.flags().contains(PtF::HUGE_PAGE) {
        panic!(
            "page walk hit a huge leaf where a table was expected ({}:{})",
            file!(),
            line!()
        );
    } else {
        Ok(entry.addr().as_u64())
    }
}

/// Install `n` leaf entries mapping `virt..` onto `phys..`. Fails with
/// `AlreadyExists` if any page in the range is present; any later failure
/// (table-frame exhaustion) unwinds the pages written so far.
pub(crate) fn map(
    ctx: &VmCtx<'_>,
    root: u64,
    virt: u64,
    phys: u64,
    n: u64,
    flags: VmFlags,
) -> VmResult<()> {
    let len = validate_range(&ctx.widths, virt, n)?;
    if !is_page_aligned(phys) {
        return Err(MemError::InvalidArgument);
    }
    ctx.widths.check_phys(phys)?;
    ctx.widths
        .check_phys(phys.checked_add(len - PAGE).ok_or(MemError::InvalidArgument)?)?;
    if is_mapped(root, virt, n, CheckMode::Any) {
        return Err(MemError::AlreadyExists);
    }

    let hw = to_hw_flags(flags);
    let user = flags.contains(VmFlags::USER);

    for i in 0..n {
        let v = virt + i * PAGE;
        let written = (|| -> VmResult<()> {
            let l4 = unsafe { linear::table_mut(root) };
            let l3p = ensure_table(ctx, &mut l4[l4_idx(v)], user)?;
            let l3 = unsafe { linear::table_mut(l3p) };
            let l2p = ensure_table(ctx, &mut l3[l3_idx(v)], user)?;
            let l2 = unsafe { linear::table_mut(l2p) };
            let l1p = ensure_table(ctx, &mut l2[l2_idx(v)], user)?;
            let l1 = unsafe { linear::table_mut(l1p) };
            let entry = &mut l1[l1_idx(v)];
            debug_assert!(entry.is_unused());
            entry.set_addr(PhysAddr::new(phys + i * PAGE), hw);
            Ok(())
        })();
        match written {
            Ok(()) => tlb::invalidate(ctx.platform, v),
            Err(err) => {
                if i > 0 {
                    unmap(ctx, root, virt, i, FrameDisposition::Keep)
                        .expect("map unwind: prefix no longer mapped");
                }
                // tables created for the failing page may now be empty
                prune(ctx, root, v);
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Remove `n` leaf entries. Every page must currently be mapped. Empty
/// PML1/PML2/PML3 tables left behind are freed, except under the two
/// shared top-level slots.
pub(crate) fn unmap(
    ctx: &VmCtx<'_>,
    root: u64,
    virt: u64,
    n: u64,
    disposition: FrameDisposition,
) -> VmResult<()> {
    validate_range(&ctx.widths, virt, n)?;
    if !is_mapped(root, virt, n, CheckMode::All) {
        return Err(MemError::NotMapped);
    }

    for i in 0..n {
        let v = virt + i * PAGE;
        let (frame, flags) = with_leaf(root, v, |entry| {
            let frame = entry.addr().as_u64();
            let flags = entry.flags();
            entry.set_unused();
            (frame, flags)
        })
        .unwrap_or_else(|_| panic!("unmap: leaf chain vanished at {:#x}", v));
        if !flags.contains(PtF::PRESENT) {
            panic!("unmap: absent leaf at {:#x} after presence check", v);
        }
        tlb::invalidate(ctx.platform, v);
        if disposition == FrameDisposition::Drop && !flags.contains(HW_BIT) {
            ctx.frames.drop_frame(frame);
        }
        // Sweep once per PML1 table: at range end or when the next page
        // crosses into a different table.
        if i == n - 1 || l1_idx(v + PAGE) == 0 {
            prune(ctx, root, v);
        }
    }
    Ok(())
}

/// Free the now-empty tables over `virt`, bottom-up. The chain may stop
/// at any level (a failed map can leave an intermediate table with no
/// children). Stops at the first non-empty level; never tears down the
/// shared linear/kernel subtrees at the root.
fn prune(ctx: &VmCtx<'_>, root: u64, virt: u64) {
    let l4 = unsafe { linear::table_mut(root) };
    let l4e = &mut l4[l4_idx(virt)];
    if l4e.is_unused() {
        return;
    }
    let l3p = l4e.addr().as_u64();
    let l3 = unsafe { linear::table_mut(l3p) };
    let l3e = &mut l3[l3_idx(virt)];
    if l3e.flags().contains(PtF::HUGE_PAGE) {
        return;
    }

    if !l3e.is_unused() {
        let l2p = l3e.addr().as_u64();
        let l2 = unsafe { linear::table_mut(l2p) };
        let l2e = &mut l2[l2_idx(virt)];
        if l2e.flags().contains(PtF::HUGE_PAGE) {
            return;
        }

        if !l2e.is_unused() {
            let l1p = l2e.addr().as_u64();
            let l1 = unsafe { linear::table_mut(l1p) };
            if !table_is_empty(l1) {
                return;
            }
            l2e.set_unused();
            ctx.frames.release_frames(l1p, 1);
        }

        if !table_is_empty(l2) {
            return;
        }
        l3e.set_unused();
        ctx.frames.release_frames(l2p, 1);
    }

    let slot = l4_idx(virt);
    if slot == LINEAR_SLOT || slot == KERNEL_SLOT {
        return;
    }
    if !table_is_empty(l3) {
        return;
    }
    l4e.set_unused();
    ctx.frames.release_frames(l3p, 1);
}

#[cfg(test)]
mod tests {
    use super::super::hosted;
    use super::*;

    const USER_BASE: u64 = 0x0040_0000;

    struct Harness {
        frames: FrameAllocator,
        platform: &'static hosted::TestPlatform,
        root: u64,
    }

    impl Harness {
        fn new() -> Self {
            let platform = hosted::TestPlatform::new(4 * 1024 * 1024);
            let mut frames = FrameAllocator::new();
            let node = platform.ram_span();
            frames.add_region(node.base, node.base + node.size);
            let root = frames.alloc_frames(1).unwrap();
            linear::zero_frame(root);
            Harness {
                frames,
                platform,
                root,
            }
        }

        fn ctx(&self) -> VmCtx<'_> {
            VmCtx {
                frames: &self.frames,
                platform: self.platform,
                widths: CpuWidths { phys: 52, virt: 48 },
            }
        }
    }

    #[test]
    fn flag_translation_round_trips() {
        for &f in &[
            VmFlags::KERNEL | VmFlags::RW,
            VmFlags::KERNEL | VmFlags::EXEC,
            VmFlags::USER | VmFlags::RW,
            VmFlags::USER,
            VmFlags::KERNEL | VmFlags::RW | VmFlags::CACHE_DISABLED,
            VmFlags::KERNEL | VmFlags::RW | VmFlags::WRITE_COMBINING,
            VmFlags::KERNEL | VmFlags::RW | VmFlags::HARDWARE,
            VmFlags::USER | VmFlags::COW,
        ] {
            assert_eq!(decode_flags(to_hw_flags(f)), f, "{f:?}");
        }
    }

    #[test]
    fn cow_request_is_never_writable() {
        let hw = to_hw_flags(VmFlags::USER | VmFlags::RW | VmFlags::COW);
        assert!(!hw.contains(PtF::WRITABLE));
        assert!(hw.contains(COW_BIT));
    }

    #[test]
    fn hardware_request_is_uncached_and_marked() {
        let hw = to_hw_flags(VmFlags::KERNEL | VmFlags::RW | VmFlags::HARDWARE);
        assert!(hw.contains(PtF::NO_CACHE));
        assert!(hw.contains(HW_BIT));
        assert!(hw.contains(PtF::GLOBAL));
    }

    #[test]
    fn map_translate_unmap_cycle() {
        let h = Harness::new();
        let ctx = h.ctx();
        let phys = h.frames.alloc_frames(2).unwrap();
        map(
            &ctx,
            h.root,
            USER_BASE,
            phys,
            2,
            VmFlags::USER | VmFlags::RW,
        )
        .unwrap();

        let (pa, fl) = translate(&ctx.widths, h.root, USER_BASE + 0x1234).unwrap();
        assert_eq!(pa, phys + 0x1234);
        assert!(fl.contains(VmFlags::USER | VmFlags::RW));
        assert!(!fl.contains(VmFlags::EXEC));

        assert!(is_mapped(h.root, USER_BASE, 2, CheckMode::All));
        unmap(&ctx, h.root, USER_BASE, 2, FrameDisposition::Drop).unwrap();
        assert!(!is_mapped(h.root, USER_BASE, 2, CheckMode::Any));
        assert_eq!(
            translate(&ctx.widths, h.root, USER_BASE),
            Err(MemError::NotMapped)
        );
        assert_eq!(h.frames.refcount(phys), Some(0));
    }

    #[test]
    fn map_rejects_any_present_page() {
        let h = Harness::new();
        let ctx = h.ctx();
        let phys = h.frames.alloc_frames(1).unwrap();
        map(&ctx, h.root, USER_BASE + PAGE, phys, 1, VmFlags::USER).unwrap();
        // a 4-page request overlapping the single mapped page
        let other = h.frames.alloc_frames(4).unwrap();
        assert_eq!(
            map(&ctx, h.root, USER_BASE, other, 4, VmFlags::USER),
            Err(MemError::AlreadyExists)
        );
        // the pre-existing mapping is untouched
        assert!(is_mapped(h.root, USER_BASE + PAGE, 1, CheckMode::All));
        assert!(!is_mapped(h.root, USER_BASE, 1, CheckMode::Any));
    }

    #[test]
    fn unmap_requires_fully_mapped_range() {
        let h = Harness::new();
        let ctx = h.ctx();
        let phys = h.frames.alloc_frames(1).unwrap();
        map(&ctx, h.root, USER_BASE, phys, 1, VmFlags::USER).unwrap();
        assert_eq!(
            unmap(&ctx, h.root, USER_BASE, 2, FrameDisposition::Drop),
            Err(MemError::NotMapped)
        );
        assert!(is_mapped(h.root, USER_BASE, 1, CheckMode::All));
        unmap(&ctx, h.root, USER_BASE, 1, FrameDisposition::Drop).unwrap();
    }

    #[test]
    fn unmap_returns_intermediate_tables() {
        let h = Harness::new();
        let ctx = h.ctx();
        let before = h.frames.free_bytes();
        let phys = h.frames.alloc_frames(1).unwrap();
        map(&ctx, h.root, USER_BASE, phys, 1, VmFlags::USER | VmFlags::RW).unwrap();
        // three table frames (l3, l2, l1) plus the data frame are gone
        assert_eq!(before - h.frames.free_bytes(), 4 * PAGE);
        unmap(&ctx, h.root, USER_BASE, 1, FrameDisposition::Drop).unwrap();
        assert_eq!(h.frames.free_bytes(), before);
        // the root itself survives, fully empty
        let l4 = unsafe { linear::table_mut(h.root) };
        assert!(table_is_empty(l4));
    }

    #[test]
    fn hardware_leaves_skip_refcounts() {
        let h = Harness::new();
        let ctx = h.ctx();
        // device memory far outside any RAM region
        let mmio = 0xB8000;
        map(
            &ctx,
            h.root,
            USER_BASE,
            mmio,
            1,
            VmFlags::KERNEL | VmFlags::RW | VmFlags::HARDWARE,
        )
        .unwrap();
        let (pa, fl) = translate(&ctx.widths, h.root, USER_BASE).unwrap();
        assert_eq!(pa, mmio);
        assert!(fl.contains(VmFlags::HARDWARE));
        unmap(&ctx, h.root, USER_BASE, 1, FrameDisposition::Drop).unwrap();
    }

    #[test]
    fn failed_map_unwinds_prefix() {
        let h = Harness::new();
        let ctx = h.ctx();
        // Eat almost everything so intermediate-table allocation fails
        // partway through a sprawling multi-table range.
        let mut hold = alloc::vec::Vec::new();
        loop {
            match h.frames.alloc_frames(1) {
                Ok(f) => hold.push(f),
                Err(_) => break,
            }
        }
        // keep enough for the first subtree only
        for f in hold.drain(..4) {
            h.frames.release_frames(f, 1);
        }
        let before = h.frames.free_bytes();
        // two pages in different PML2 subranges: second needs a fresh l2+l1
        let virt = USER_BASE;
        let far = (1u64 << 30) - PAGE - virt;
        let n = far / PAGE + 2;
        let err = map(&ctx, h.root, virt, 0x4000_0000, n, VmFlags::USER | VmFlags::RW);
        assert_eq!(err, Err(MemError::OutOfMemory));
        assert!(!is_mapped(h.root, virt, n, CheckMode::Any));
        assert_eq!(h.frames.free_bytes(), before);
        for f in hold {
            h.frames.release_frames(f, 1);
        }
    }

    #[test]
    fn map_broadcasts_shootdown_per_page() {
        let h = Harness::new();
        let ctx = h.ctx();
        let phys = h.frames.alloc_frames(3).unwrap();
        let start = h.platform.broadcasts().len();
        map(&ctx, h.root, USER_BASE, phys, 3, VmFlags::USER | VmFlags::RW).unwrap();
        let sent = h.platform.broadcasts();
        assert_eq!(sent.len() - start, 3);
        assert!(sent[start..].contains(&(USER_BASE + 2 * PAGE)));
    }

    #[test]
    fn rejects_malformed_arguments() {
        let h = Harness::new();
        let ctx = h.ctx();
        assert_eq!(
            map(&ctx, h.root, USER_BASE + 1, 0, 1, VmFlags::USER),
            Err(MemError::InvalidArgument)
        );
        assert_eq!(
            map(&ctx, h.root, USER_BASE, 0x333, 1, VmFlags::USER),
            Err(MemError::InvalidArgument)
        );
        assert_eq!(
            map(&ctx, h.root, USER_BASE, 0, 0, VmFlags::USER),
            Err(MemError::InvalidArgument)
        );
        // non-canonical
        assert_eq!(
            map(&ctx, h.root, 0x0010_0000_0000_0000, 0, 1, VmFlags::USER),
            Err(MemError::InvalidArgument)
        );
        // range crossing the canonical hole
        assert_eq!(
            map(
                &ctx,
                h.root,
                0x0000_7fff_ffff_f000,
                0,
                2,
                VmFlags::USER
            ),
            Err(MemError::InvalidArgument)
        );
    }
}
