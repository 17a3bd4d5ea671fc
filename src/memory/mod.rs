// memory/mod.rs — VANADIUM virtual-memory manager.
//
// Features
//  - firmware-driven physical memory discovery with per-region refcounts
//  - linear window over all of RAM (PML4 slot 256, 1 GiB leaves)
//  - shared kernel half (slot 511): image sections plus the kernel
//    free-page window, identical in every address space
//  - kernel map/alloc and user fixed mappings at 4 KiB granularity
//  - per-process address spaces, cloned copy-on-write at fork
//  - page-fault repair (stale TLB, COW) wired to the exception dispatcher
//  - guard-paged stacks carved from the top of the owning window
//
// All of it is bundled in one `MemoryManager`; the kernel installs a
// process-wide singleton via `memory_init` and reaches it through the
// free functions at the bottom of this file. Collaborators (firmware
// tables, scheduler, IPIs) come in through `platform::Platform`.
//
// Lock order: address space, then range list, then refcount region.
// `clone` is the only two-space holder (source first, the destination is
// not yet visible). No lock is held across a blocking operation.

use core::fmt;

use alloc::sync::Arc;
use spin::Once;
use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::structures::paging::PageTableFlags as PtF;
use x86_64::{PhysAddr, VirtAddr};

use crate::arch;
use crate::layout::{
    align_down, align_up, is_page_aligned, pages_for, GIB, KERNEL_WINDOW_LIMIT, LINEAR_SLOT,
    KERNEL_SLOT, PAGE_SIZE, USER_MEMORY_END, USER_MEMORY_START,
};
use crate::log::try_get_logger;
use crate::platform::{Platform, SectionKind};

pub mod addr;
pub mod fault;
pub mod frame;
pub mod heap;
pub mod linear;
pub mod paging;
pub mod range;
pub mod space;
pub mod stack;
pub mod tlb;

#[cfg(not(target_os = "none"))]
pub mod hosted;

pub use addr::CpuWidths;
pub use paging::{CheckMode, VmFlags};
pub use space::AddressSpace;
pub use x86_64::structures::idt::PageFaultErrorCode as PageFaultCode;

use frame::FrameAllocator;
use paging::{FrameDisposition, VmCtx};
use range::RangeList;

const PAGE: u64 = PAGE_SIZE as u64;

// ───────────────────────────────────────────────────────────────────────────────
// Errors
// ───────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// Alignment or canonical form violated, or flags make no sense here.
    InvalidArgument,
    /// Frame or page pool exhausted, or a refcount saturated.
    OutOfMemory,
    /// Mapping requested over a present page.
    AlreadyExists,
    /// Unmap or translate against an unmapped page.
    NotMapped,
    /// Virtual address outside the window this API serves.
    OutOfBound,
    /// Operation refused on the kernel address space.
    Unauthorized,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub type VmResult<T> = core::result::Result<T, MemError>;

// ───────────────────────────────────────────────────────────────────────────────
// Manager
// ───────────────────────────────────────────────────────────────────────────────

pub struct MemoryManager {
    widths: CpuWidths,
    platform: &'static dyn Platform,
    frames: FrameAllocator,
    kernel_space: AddressSpace,
    /// First page of the kernel free-page window (everything below is
    /// image or unmapped guard territory).
    kernel_window_base: u64,
}

impl MemoryManager {
    /// Full bring-up: discover RAM, build the kernel root (linear window,
    /// shared kernel tables, image sections), initialise the page
    /// windows. On the kernel target this also switches CR3, programs
    /// the PAT and enables NX.
    pub fn new(platform: &'static dyn Platform) -> VmResult<Self> {
        let widths = arch::probe_cpu_widths();
        let image = platform.kernel_image();

        let mut frames = FrameAllocator::new();
        for node in platform.memory_nodes() {
            let base = align_up(node.base, PAGE);
            let limit = align_down(node.base + node.size, PAGE);
            if limit > base {
                frames.add_region(base, limit);
            }
        }
        for node in platform.reserved_nodes() {
            let base = align_down(node.base, PAGE);
            let limit = align_up(node.base + node.size, PAGE);
            if limit > base {
                frames.subtract(base, limit - base);
            }
        }

        // The image is resident but must never be handed out.
        let image_base = align_down(image.phys_base, PAGE);
        let image_len = align_up(image.phys_base + image.phys_size, PAGE) - image_base;
        frames.subtract(image_base, image_len);
        frames.claim_range(image_base, image_len);

        let ctx = VmCtx {
            frames: &frames,
            platform,
            widths,
        };

        // Kernel root with the two shared slots.
        let pml4 = ctx.frames.alloc_frames(1)?;
        linear::zero_frame(pml4);
        build_linear_window(&ctx, pml4)?;
        let kernel_l3 = ctx.frames.alloc_frames(1)?;
        linear::zero_frame(kernel_l3);
        let pml4_table = unsafe { linear::table_mut(pml4) };
        pml4_table[KERNEL_SLOT]
            .set_addr(PhysAddr::new(kernel_l3), PtF::PRESENT | PtF::WRITABLE);

        map_kernel_sections(&ctx, pml4, &image)?;

        let kernel_window_base = align_up(image.virt_end, PAGE);
        if kernel_window_base >= KERNEL_WINDOW_LIMIT {
            return Err(MemError::InvalidArgument);
        }
        let kernel_space = AddressSpace::new_kernel(
            pml4,
            RangeList::with_span(kernel_window_base, KERNEL_WINDOW_LIMIT - kernel_window_base),
        );

        #[cfg(target_os = "none")]
        {
            arch::enable_no_execute();
            arch::program_pat();
            unsafe { arch::load_root(pml4) };
        }

        if let Some(l) = try_get_logger() {
            l.log("[MEM] manager online");
        }

        Ok(MemoryManager {
            widths,
            platform,
            frames,
            kernel_space,
            kernel_window_base,
        })
    }

    pub(crate) fn ctx(&self) -> VmCtx<'_> {
        VmCtx {
            frames: &self.frames,
            platform: self.platform,
            widths: self.widths,
        }
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn kernel_space(&self) -> &AddressSpace {
        &self.kernel_space
    }

    fn check_size(size: u64) -> VmResult<u64> {
        if size == 0 || !is_page_aligned(size) {
            return Err(MemError::InvalidArgument);
        }
        Ok(size / PAGE)
    }

    fn check_kernel_window(&self, virt: u64, size: u64) -> VmResult<()> {
        if virt < self.kernel_window_base
            || virt.checked_add(size).map_or(true, |end| end > KERNEL_WINDOW_LIMIT)
        {
            return Err(MemError::OutOfBound);
        }
        Ok(())
    }

    fn check_user_window(virt: u64, size: u64) -> VmResult<()> {
        if virt < USER_MEMORY_START
            || virt.checked_add(size).map_or(true, |end| end > USER_MEMORY_END)
        {
            return Err(MemError::OutOfBound);
        }
        Ok(())
    }

    // ── kernel window ──────────────────────────────────────────────────────────

    /// Map `size` bytes of existing physical memory (device or borrowed
    /// frames) into fresh kernel pages.
    pub fn kernel_map(&self, phys: u64, size: u64, flags: VmFlags) -> VmResult<u64> {
        let n = Self::check_size(size)?;
        if flags.intersects(VmFlags::USER | VmFlags::COW) {
            return Err(MemError::InvalidArgument);
        }
        let mut inner = self.kernel_space.lock();
        let virt = inner.pages.take(size).ok_or(MemError::OutOfMemory)?;
        match paging::map(&self.ctx(), inner.pml4, virt, phys, n, flags | VmFlags::KERNEL) {
            Ok(()) => Ok(virt),
            Err(err) => {
                inner.pages.add(virt, size);
                Err(err)
            }
        }
    }

    /// Reverse of [`kernel_map`]: refcounts are dropped for every leaf
    /// that is not a hardware mapping.
    pub fn kernel_unmap(&self, virt: u64, size: u64) -> VmResult<()> {
        let n = Self::check_size(size)?;
        self.check_kernel_window(virt, size)?;
        let mut inner = self.kernel_space.lock();
        paging::unmap(&self.ctx(), inner.pml4, virt, n, FrameDisposition::Drop)?;
        inner.pages.add(virt, size);
        Ok(())
    }

    /// Allocate and map fresh frames; rejects `HARDWARE` (there is no
    /// device behind fresh RAM).
    pub fn kernel_alloc(&self, size: u64, flags: VmFlags) -> VmResult<u64> {
        let n = Self::check_size(size)?;
        if flags.intersects(VmFlags::HARDWARE | VmFlags::USER | VmFlags::COW) {
            return Err(MemError::InvalidArgument);
        }
        let ctx = self.ctx();
        let mut inner = self.kernel_space.lock();
        let virt = inner.pages.take(size).ok_or(MemError::OutOfMemory)?;

        for i in 0..n {
            let page = virt + i * PAGE;
            let fail = |err| {
                if i > 0 {
                    paging::unmap(&ctx, inner.pml4, virt, i, FrameDisposition::Drop)
                        .expect("kernel_alloc unwind: prefix no longer mapped");
                }
                err
            };
            let frame = match ctx.frames.alloc_frames(1) {
                Ok(f) => f,
                Err(err) => {
                    let err = fail(err);
                    inner.pages.add(virt, size);
                    return Err(err);
                }
            };
            if let Err(err) =
                paging::map(&ctx, inner.pml4, page, frame, 1, flags | VmFlags::KERNEL)
            {
                ctx.frames.release_frames(frame, 1);
                let err = fail(err);
                inner.pages.add(virt, size);
                return Err(err);
            }
        }
        Ok(virt)
    }

    /// Reverse of [`kernel_alloc`]: releases the pages and the frames.
    pub fn kernel_free(&self, virt: u64, size: u64) -> VmResult<()> {
        self.kernel_unmap(virt, size)
    }

    // ── user mappings ──────────────────────────────────────────────────────────

    /// Install a fixed mapping in a user address space; claims the span
    /// from the space's free-page window.
    pub fn user_map_direct(
        &self,
        phys: u64,
        virt: u64,
        size: u64,
        flags: VmFlags,
        space: &AddressSpace,
    ) -> VmResult<()> {
        let n = Self::check_size(size)?;
        Self::check_user_window(virt, size)?;
        if !flags.contains(VmFlags::USER) || flags.intersects(VmFlags::KERNEL | VmFlags::COW) {
            return Err(MemError::InvalidArgument);
        }
        let mut inner = space.lock();
        if inner.pml4 == 0 {
            return Err(MemError::InvalidArgument);
        }
        paging::map(&self.ctx(), inner.pml4, virt, phys, n, flags)?;
        inner.pages.remove(virt, size);
        Ok(())
    }

    pub fn user_unmap(&self, virt: u64, size: u64, space: &AddressSpace) -> VmResult<()> {
        let n = Self::check_size(size)?;
        Self::check_user_window(virt, size)?;
        let mut inner = space.lock();
        if inner.pml4 == 0 {
            return Err(MemError::InvalidArgument);
        }
        paging::unmap(&self.ctx(), inner.pml4, virt, n, FrameDisposition::Drop)?;
        inner.pages.add(virt, size);
        Ok(())
    }

    /// Resolve a mapping; `None` targets the kernel space.
    pub fn translate(&self, virt: u64, space: Option<&AddressSpace>) -> VmResult<(u64, VmFlags)> {
        let target = space.unwrap_or(&self.kernel_space);
        let inner = target.lock();
        if inner.pml4 == 0 {
            return Err(MemError::InvalidArgument);
        }
        paging::translate(&self.widths, inner.pml4, virt)
    }

    // ── address-space lifecycle ────────────────────────────────────────────────

    pub fn create_process_memory(&self) -> VmResult<Arc<AddressSpace>> {
        let kernel_root = self.kernel_space.root_phys();
        space::create(&self.ctx(), kernel_root)
    }

    pub fn clone_process_memory(&self, src: &AddressSpace) -> VmResult<Arc<AddressSpace>> {
        space::clone(&self.ctx(), src)
    }

    pub fn destroy_process_memory(&self, space: &AddressSpace) -> VmResult<()> {
        space::destroy(&self.ctx(), space)
    }

    // ── stacks ─────────────────────────────────────────────────────────────────

    /// Guard-paged stack; returns the exclusive top. Kernel stacks live
    /// in the kernel window regardless of `space`.
    pub fn map_stack(
        &self,
        size: u64,
        is_kernel: bool,
        space: Option<&AddressSpace>,
    ) -> VmResult<u64> {
        let target = if is_kernel {
            &self.kernel_space
        } else {
            space.ok_or(MemError::InvalidArgument)?
        };
        if !is_kernel && target.is_kernel() {
            return Err(MemError::InvalidArgument);
        }
        stack::map_stack(&self.ctx(), target, size, is_kernel)
    }

    pub fn unmap_stack(
        &self,
        top: u64,
        size: u64,
        is_kernel: bool,
        space: Option<&AddressSpace>,
    ) -> VmResult<()> {
        let target = if is_kernel {
            &self.kernel_space
        } else {
            space.ok_or(MemError::InvalidArgument)?
        };
        stack::unmap_stack(&self.ctx(), target, top, size, is_kernel)
    }

    // ── raw physical allocator ─────────────────────────────────────────────────

    pub fn alloc_frames(&self, n: u64) -> VmResult<u64> {
        self.frames.alloc_frames(n)
    }

    pub fn release_frames(&self, base: u64, n: u64) {
        self.frames.release_frames(base, n)
    }

    // ── faults ─────────────────────────────────────────────────────────────────

    pub fn handle_page_fault(&self, fault_addr: u64, code: PageFaultErrorCode, inst_addr: u64) {
        fault::handle_page_fault(&self.ctx(), fault_addr, code, inst_addr);
    }
}

/// Slot-256 window: 1 GiB identity leaves over every discovered region.
fn build_linear_window(ctx: &VmCtx<'_>, pml4: u64) -> VmResult<()> {
    let window_l3 = ctx.frames.alloc_frames(1)?;
    linear::zero_frame(window_l3);
    let l4 = unsafe { linear::table_mut(pml4) };
    l4[LINEAR_SLOT].set_addr(PhysAddr::new(window_l3), PtF::PRESENT | PtF::WRITABLE);

    let l3 = unsafe { linear::table_mut(window_l3) };
    let leaf = PtF::PRESENT | PtF::WRITABLE | PtF::HUGE_PAGE | PtF::GLOBAL | PtF::NO_EXECUTE;
    for (base, limit) in ctx.frames.region_spans() {
        let mut gib = align_down(base, GIB);
        while gib < limit {
            let idx = (gib >> 30) as usize;
            if idx >= 512 {
                // beyond the 512 GiB the window can see
                if let Some(l) = try_get_logger() {
                    l.log("[MEM] RAM beyond the linear window, ignored");
                }
                break;
            }
            if l3[idx].is_unused() {
                l3[idx].set_addr(PhysAddr::new(gib), leaf);
            }
            gib += GIB;
        }
    }
    Ok(())
}

fn section_flags(kind: SectionKind) -> VmFlags {
    match kind {
        SectionKind::Text => VmFlags::KERNEL | VmFlags::EXEC,
        SectionKind::Rodata => VmFlags::KERNEL,
        SectionKind::Data => VmFlags::KERNEL | VmFlags::RW,
    }
}

/// Map the image into the shared kernel tables: text RX, rodata R, data
/// RW+NX, all global. Overlapping or malformed sections are refused.
fn map_kernel_sections(
    ctx: &VmCtx<'_>,
    pml4: u64,
    image: &crate::platform::KernelImage<'_>,
) -> VmResult<()> {
    let mut spans: alloc::vec::Vec<(u64, u64)> = alloc::vec::Vec::new();
    for s in image.sections {
        if s.size == 0 {
            continue;
        }
        if !is_page_aligned(s.virt) || !is_page_aligned(s.phys) {
            return Err(MemError::InvalidArgument);
        }
        if (s.virt >> 39) & 0x1ff != KERNEL_SLOT as u64 {
            return Err(MemError::InvalidArgument);
        }
        spans.push((s.virt, align_up(s.size, PAGE)));
    }
    spans.sort_unstable();
    for pair in spans.windows(2) {
        if pair[0].0 + pair[0].1 > pair[1].0 {
            return Err(MemError::InvalidArgument);
        }
    }
    for s in image.sections {
        if s.size == 0 {
            continue;
        }
        paging::map(
            ctx,
            pml4,
            s.virt,
            s.phys,
            pages_for(s.size),
            section_flags(s.kind),
        )?;
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────────────────────
// Singleton & public surface
// ───────────────────────────────────────────────────────────────────────────────

static MEMORY: Once<MemoryManager> = Once::new();

/// Bring the memory subsystem up exactly once. A second call means the
/// boot path is broken and panics.
pub fn memory_init(platform: &'static dyn Platform) {
    #[cfg(all(target_arch = "x86_64", target_os = "none", feature = "vm-log-serial"))]
    crate::arch::x86_64::serial::install_log_sink();
    heap::init();

    if MEMORY.is_completed() {
        panic!("memory_init called twice ({}:{})", file!(), line!());
    }
    let manager = MemoryManager::new(platform).expect("memory bring-up failed");
    let manager = MEMORY.call_once(move || manager);
    manager
        .platform
        .register_page_fault_handler(page_fault_entry);
}

/// The process-wide manager; fatal before `memory_init`.
pub fn memory() -> &'static MemoryManager {
    MEMORY
        .get()
        .expect("memory subsystem used before memory_init")
}

/// Exception-dispatcher entry for vector 14.
pub fn page_fault_entry(fault_addr: u64, error_code: u64, inst_addr: u64) {
    memory().handle_page_fault(
        fault_addr,
        PageFaultErrorCode::from_bits_truncate(error_code),
        inst_addr,
    );
}

pub fn kernel_map(phys: PhysAddr, size: u64, flags: VmFlags) -> VmResult<VirtAddr> {
    memory()
        .kernel_map(phys.as_u64(), size, flags)
        .map(VirtAddr::new)
}

pub fn kernel_unmap(virt: VirtAddr, size: u64) -> VmResult<()> {
    memory().kernel_unmap(virt.as_u64(), size)
}

pub fn kernel_alloc(size: u64, flags: VmFlags) -> VmResult<VirtAddr> {
    memory().kernel_alloc(size, flags).map(VirtAddr::new)
}

pub fn kernel_free(virt: VirtAddr, size: u64) -> VmResult<()> {
    memory().kernel_free(virt.as_u64(), size)
}

pub fn user_map_direct(
    phys: PhysAddr,
    virt: VirtAddr,
    size: u64,
    flags: VmFlags,
    space: &AddressSpace,
) -> VmResult<()> {
    memory().user_map_direct(phys.as_u64(), virt.as_u64(), size, flags, space)
}

pub fn user_unmap(virt: VirtAddr, size: u64, space: &AddressSpace) -> VmResult<()> {
    memory().user_unmap(virt.as_u64(), size, space)
}

pub fn translate(virt: VirtAddr, space: Option<&AddressSpace>) -> VmResult<(PhysAddr, VmFlags)> {
    memory()
        .translate(virt.as_u64(), space)
        .map(|(pa, fl)| (PhysAddr::new(pa), fl))
}

pub fn create_process_memory() -> VmResult<Arc<AddressSpace>> {
    memory().create_process_memory()
}

pub fn clone_process_memory(src: &AddressSpace) -> VmResult<Arc<AddressSpace>> {
    memory().clone_process_memory(src)
}

pub fn destroy_process_memory(space: &AddressSpace) -> VmResult<()> {
    memory().destroy_process_memory(space)
}

pub fn map_stack(size: u64, is_kernel: bool, space: Option<&AddressSpace>) -> VmResult<VirtAddr> {
    memory().map_stack(size, is_kernel, space).map(VirtAddr::new)
}

pub fn unmap_stack(
    top: VirtAddr,
    size: u64,
    is_kernel: bool,
    space: Option<&AddressSpace>,
) -> VmResult<()> {
    memory().unmap_stack(top.as_u64(), size, is_kernel, space)
}

pub fn alloc_frames(n: u64) -> VmResult<PhysAddr> {
    memory().alloc_frames(n).map(PhysAddr::new)
}

pub fn release_frames(base: PhysAddr, n: u64) {
    memory().release_frames(base.as_u64(), n)
}

pub const fn user_start() -> u64 {
    USER_MEMORY_START
}

pub const fn user_end() -> u64 {
    USER_MEMORY_END
}
