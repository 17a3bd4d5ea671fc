//! Linear physical window: every frame is readable/writable at
//! `phys + LINEAR_BASE`, so page tables are plain memory and no scratch
//! mappings are ever needed.
//!
//! On the kernel target the window is PML4 slot 256, populated with 1 GiB
//! leaves at bootstrap (the boot environment provides the same mapping, so
//! table frames are reachable before our own root is live). Hosted builds
//! redirect the arithmetic into a pinned arena that stands in for RAM.

use x86_64::structures::paging::PageTable;

use crate::layout::PAGE_SIZE;

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        use crate::layout::LINEAR_BASE;

        #[inline]
        pub fn phys_to_linear(phys: u64) -> u64 {
            LINEAR_BASE + phys
        }

        #[inline]
        pub fn linear_to_phys(virt: u64) -> u64 {
            virt - LINEAR_BASE
        }

        #[inline]
        fn window_ptr(phys: u64) -> *mut u8 {
            phys_to_linear(phys) as *mut u8
        }
    } else {
        use core::sync::atomic::{AtomicU64, Ordering};

        // Host pointer standing in for pretend-physical address zero.
        static WINDOW_SHIFT: AtomicU64 = AtomicU64::new(0);

        /// Point the window at an emulated RAM arena: pretend-physical
        /// `pretend_base` resolves to host address `host_base`.
        pub fn set_window(host_base: u64, pretend_base: u64) {
            WINDOW_SHIFT.store(host_base.wrapping_sub(pretend_base), Ordering::SeqCst);
        }

        #[inline]
        pub fn phys_to_linear(phys: u64) -> u64 {
            phys.wrapping_add(WINDOW_SHIFT.load(Ordering::Relaxed))
        }

        #[inline]
        pub fn linear_to_phys(virt: u64) -> u64 {
            virt.wrapping_sub(WINDOW_SHIFT.load(Ordering::Relaxed))
        }

        #[inline]
        fn window_ptr(phys: u64) -> *mut u8 {
            phys_to_linear(phys) as *mut u8
        }
    }
}

/// View a table frame as a live `PageTable`.
///
/// # Safety
/// `phys` must be a 4 KiB table frame owned by the caller's walk; the
/// address-space lock serialises mutation.
pub(crate) unsafe fn table_mut(phys: u64) -> &'static mut PageTable {
    &mut *(window_ptr(phys) as *mut PageTable)
}

pub(crate) fn zero_frame(phys: u64) {
    unsafe {
        core::ptr::write_bytes(window_ptr(phys), 0, PAGE_SIZE);
    }
}

/// 4 KiB frame-to-frame copy through the window (COW resolution).
pub(crate) fn copy_frame(src_phys: u64, dst_phys: u64) {
    unsafe {
        core::ptr::copy_nonoverlapping(window_ptr(src_phys), window_ptr(dst_phys), PAGE_SIZE);
    }
}

/// Byte view of a frame, for the refcount tables and the test suite.
///
/// # Safety
/// Same ownership rules as [`table_mut`].
pub(crate) unsafe fn frame_bytes(phys: u64, len: usize) -> &'static mut [u8] {
    core::slice::from_raw_parts_mut(window_ptr(phys), len)
}
