//! Collaborator seam for the memory core.
//!
//! The memory manager never talks to firmware tables, the exception
//! dispatcher, the IPI facility or the scheduler directly; the kernel hands
//! it one [`Platform`] object at `memory_init` time and every outward call
//! goes through it. Hosted tests substitute a recording mock.

use alloc::sync::Arc;

use crate::memory::space::AddressSpace;

/// A physical memory span reported by firmware, byte-granular. The
/// bootstrap path aligns memory nodes inward and reserved nodes outward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRange {
    pub base: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// Executable, read-only.
    Text,
    /// Read-only data.
    Rodata,
    /// Writable data, stacks, early heap; mapped no-execute.
    Data,
}

/// One loadable piece of the kernel image.
#[derive(Debug, Clone, Copy)]
pub struct KernelSection {
    pub virt: u64,
    pub phys: u64,
    pub size: u64,
    pub kind: SectionKind,
}

/// Where the kernel image sits, physically and virtually.
#[derive(Debug, Clone, Copy)]
pub struct KernelImage<'a> {
    /// First physical byte of the image.
    pub phys_base: u64,
    /// Physical bytes occupied (sections plus padding).
    pub phys_size: u64,
    /// First virtual address past the image; the kernel page window
    /// starts at the next page boundary.
    pub virt_end: u64,
    pub sections: &'a [KernelSection],
}

/// What a fatal fault records into the offending thread's error table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    pub fault_addr: u64,
    pub inst_addr: u64,
}

/// Entry point the exception dispatcher invokes on vector 14, with CR2,
/// the raw error code and the interrupted RIP.
pub type PageFaultEntry = fn(fault_addr: u64, error_code: u64, inst_addr: u64);

pub trait Platform: Send + Sync {
    /// Usable RAM nodes from the firmware tables.
    fn memory_nodes(&self) -> &[PhysRange];

    /// Firmware-reserved spans, subtracted from the free pool.
    fn reserved_nodes(&self) -> &[PhysRange];

    fn kernel_image(&self) -> KernelImage<'_>;

    /// Enqueue a TLB-invalidate IPI for `page` to every other active core.
    /// Returns once the message is dispatched, not completed.
    fn broadcast_invalidate(&self, page: u64);

    /// Hand the page-fault entry to the exception dispatcher.
    fn register_page_fault_handler(&self, entry: PageFaultEntry);

    /// Address space of the thread running on this core, or `None` while
    /// the scheduler is not running.
    fn current_address_space(&self) -> Option<Arc<AddressSpace>>;

    /// Record a fatal fault against the current thread and raise its
    /// segmentation-violation signal. The faulting thread leaves the CPU
    /// at the next dispatch, so this returns normally.
    fn report_page_fault(&self, record: FaultRecord);
}
