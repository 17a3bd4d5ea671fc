//! TLB coherence: local invalidation plus shoot-down broadcast.
//!
//! Every PTE mutation drops the local translation with `invlpg` and then
//! enqueues an invalidate IPI for the same page to every other active
//! core. The mapper waits for the message to be dispatched, not acted on;
//! a caller that hands a fresh mapping to another core without a context
//! switch in between must fence first.

use crate::arch;
use crate::platform::Platform;

#[inline]
pub(crate) fn invalidate(platform: &dyn Platform, virt: u64) {
    arch::invlpg(virt);
    platform.broadcast_invalidate(virt);
}

/// Full flush of the running core's non-global entries (CR3 reload).
/// Used after an address-space clone downgrades the source's writable
/// entries to copy-on-write in bulk.
#[inline]
pub(crate) fn flush_current() {
    arch::flush_tlb_all();
}
