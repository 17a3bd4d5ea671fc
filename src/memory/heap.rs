//! Kernel heap bootstrap.
//!
//! The allocator paths themselves live on the heap (range lists, address
//! space objects), so the heap cannot wait for the page allocator: it is
//! seeded from a static arena in `.bss` before `MemoryManager::new` runs.
//! Hosted builds use the host allocator and this module is inert there.

#[cfg(target_os = "none")]
mod kernel {
    use core::cell::UnsafeCell;
    use core::sync::atomic::{AtomicBool, Ordering};

    use linked_list_allocator::LockedHeap;

    use crate::log::try_get_logger;

    const BOOTSTRAP_HEAP_BYTES: usize = 2 * 1024 * 1024;

    #[global_allocator]
    static KERNEL_HEAP: LockedHeap = LockedHeap::empty();

    static HEAP_ENABLED: AtomicBool = AtomicBool::new(false);

    #[repr(align(4096))]
    struct BootstrapArena(UnsafeCell<[u8; BOOTSTRAP_HEAP_BYTES]>);

    // Handed to the heap exactly once in init(); never aliased after.
    unsafe impl Sync for BootstrapArena {}

    static ARENA: BootstrapArena = BootstrapArena(UnsafeCell::new([0; BOOTSTRAP_HEAP_BYTES]));

    pub fn init() {
        if HEAP_ENABLED.swap(true, Ordering::SeqCst) {
            return;
        }
        unsafe {
            KERNEL_HEAP
                .lock()
                .init(ARENA.0.get() as *mut u8, BOOTSTRAP_HEAP_BYTES);
        }
        if let Some(l) = try_get_logger() {
            l.log("[HEAP] kernel heap initialized");
        }
    }
}

#[cfg(target_os = "none")]
pub use kernel::init;

#[cfg(not(target_os = "none"))]
pub fn init() {}
