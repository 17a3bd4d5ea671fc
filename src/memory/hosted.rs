//! Hosted harness: emulated physical memory and a recording platform.
//!
//! The test suite runs the real allocator/mapper/fault code against a
//! pinned arena. Pretend-physical addresses start at 4 GiB and resolve
//! into the arena through the linear window's hosted offset, so page
//! tables, refcount tables and COW copies are genuinely written and read.
//! TLB shoot-downs, fault reports and the current-address-space query are
//! recorded by [`TestPlatform`] instead of touching hardware.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::{Mutex, Once};

use crate::layout::{align_up, pages_for, KERNEL_IMAGE_BASE, PAGE_SIZE};
use crate::log::Sink;
use crate::platform::{
    FaultRecord, KernelImage, KernelSection, PageFaultEntry, PhysRange, Platform, SectionKind,
};

use super::linear;
use super::space::AddressSpace;

const PAGE: u64 = PAGE_SIZE as u64;
// Generously sized; the backing is allocated zeroed, so untouched pages
// never materialise.
const ARENA_BYTES: usize = 768 * 1024 * 1024;

/// Pretend-physical address of the first arena byte.
pub const PRETEND_PHYS_BASE: u64 = 0x1_0000_0000;

struct CaptureSink(Mutex<Vec<String>>);

impl Sink for CaptureSink {
    fn write_line(&self, line: &str) {
        self.0.lock().push(String::from(line));
    }
}

static CAPTURE_SINK: CaptureSink = CaptureSink(Mutex::new(Vec::new()));

/// Everything logged so far (every harness shares one sink).
pub fn captured_log() -> Vec<String> {
    CAPTURE_SINK.0.lock().clone()
}

struct Arena {
    next: Mutex<u64>,
    limit: u64,
}

static ARENA: Once<Arena> = Once::new();

fn arena() -> &'static Arena {
    ARENA.call_once(|| {
        let backing = vec![0u8; ARENA_BYTES + PAGE_SIZE].leak();
        let base = align_up(backing.as_mut_ptr() as u64, PAGE);
        linear::set_window(base, PRETEND_PHYS_BASE);
        crate::log::init_logger(&CAPTURE_SINK);
        Arena {
            next: Mutex::new(0),
            limit: ARENA_BYTES as u64,
        }
    })
}

/// Carve an emulated RAM node out of the arena.
pub fn alloc_ram(bytes: usize) -> PhysRange {
    let a = arena();
    let len = align_up(bytes as u64, PAGE);
    let mut next = a.next.lock();
    assert!(*next + len <= a.limit, "hosted arena exhausted");
    let base = PRETEND_PHYS_BASE + *next;
    *next += len;
    PhysRange { base, size: len }
}

/// Mutable byte view of an emulated frame, standing in for the writes a
/// mapped page would receive on hardware. Callers serialise access the
/// way real owners of the frame would.
pub fn frame_view(phys: u64) -> &'static mut [u8] {
    unsafe { linear::frame_bytes(phys, PAGE_SIZE) }
}

/// A recording [`Platform`] over one emulated RAM node with a fabricated
/// kernel image in it.
pub struct TestPlatform {
    ram: PhysRange,
    memory_nodes: Vec<PhysRange>,
    reserved_nodes: Vec<PhysRange>,
    sections: Vec<KernelSection>,
    image_phys: u64,
    image_size: u64,
    image_virt_end: u64,
    broadcasts: Mutex<Vec<u64>>,
    current: Mutex<Option<Arc<AddressSpace>>>,
    faults: Mutex<Vec<FaultRecord>>,
    handler: Mutex<Option<PageFaultEntry>>,
}

/// Image shape: 4 pages of text, 2 of rodata, 10 of data.
const TEXT_PAGES: u64 = 4;
const RODATA_PAGES: u64 = 2;
const DATA_PAGES: u64 = 10;
const IMAGE_PAGES: u64 = TEXT_PAGES + RODATA_PAGES + DATA_PAGES;

impl TestPlatform {
    pub fn new(ram_bytes: usize) -> &'static TestPlatform {
        Self::with_reserved(ram_bytes, &[])
    }

    /// Like [`TestPlatform::new`] with reserved holes given as
    /// `(offset, size)` pairs inside the node.
    pub fn with_reserved(ram_bytes: usize, holes: &[(u64, u64)]) -> &'static TestPlatform {
        let ram = alloc_ram(ram_bytes);
        let reserved: Vec<PhysRange> = holes
            .iter()
            .map(|&(offset, size)| PhysRange {
                base: ram.base + offset,
                size,
            })
            .collect();
        // keep clear of the refcount-table carve-out at the region head
        let table_pages = pages_for(ram.size / PAGE * 2);
        assert!(table_pages <= 16, "test node too large for fixed image slot");
        let image_phys = ram.base + 16 * PAGE;
        let image_size = IMAGE_PAGES * PAGE;

        let mut sections = Vec::new();
        let mut virt = KERNEL_IMAGE_BASE;
        let mut phys = image_phys;
        for (pages, kind) in [
            (TEXT_PAGES, SectionKind::Text),
            (RODATA_PAGES, SectionKind::Rodata),
            (DATA_PAGES, SectionKind::Data),
        ] {
            sections.push(KernelSection {
                virt,
                phys,
                size: pages * PAGE,
                kind,
            });
            virt += pages * PAGE;
            phys += pages * PAGE;
        }

        Box::leak(Box::new(TestPlatform {
            ram,
            memory_nodes: vec![ram],
            reserved_nodes: reserved,
            sections,
            image_phys,
            image_size,
            image_virt_end: virt,
            broadcasts: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            faults: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
        }))
    }

    pub fn ram_span(&self) -> PhysRange {
        self.ram
    }

    pub fn image_span(&self) -> PhysRange {
        PhysRange {
            base: self.image_phys,
            size: self.image_size,
        }
    }

    pub fn broadcasts(&self) -> Vec<u64> {
        self.broadcasts.lock().clone()
    }

    pub fn set_current_space(&self, space: Option<Arc<AddressSpace>>) {
        *self.current.lock() = space;
    }

    pub fn take_faults(&self) -> Vec<FaultRecord> {
        core::mem::take(&mut *self.faults.lock())
    }

    pub fn registered_handler(&self) -> Option<PageFaultEntry> {
        *self.handler.lock()
    }
}

impl Platform for TestPlatform {
    fn memory_nodes(&self) -> &[PhysRange] {
        &self.memory_nodes
    }

    fn reserved_nodes(&self) -> &[PhysRange] {
        &self.reserved_nodes
    }

    fn kernel_image(&self) -> KernelImage<'_> {
        KernelImage {
            phys_base: self.image_phys,
            phys_size: self.image_size,
            virt_end: self.image_virt_end,
            sections: &self.sections,
        }
    }

    fn broadcast_invalidate(&self, page: u64) {
        self.broadcasts.lock().push(page);
    }

    fn register_page_fault_handler(&self, entry: PageFaultEntry) {
        *self.handler.lock() = Some(entry);
    }

    fn current_address_space(&self) -> Option<Arc<AddressSpace>> {
        self.current.lock().clone()
    }

    fn report_page_fault(&self, record: FaultRecord) {
        self.faults.lock().push(record);
    }
}
