//! VANADIUM kernel virtual-memory core.
//!
//! Everything the rest of the kernel knows about memory lives behind
//! [`memory`]: physical-frame accounting, the 4-level page-table mapper,
//! per-process address spaces with copy-on-write cloning, the page-fault
//! repair paths, and guard-paged stack construction. Collaborating
//! subsystems (firmware tables, scheduler, exception dispatcher, IPI
//! facility) are reached exclusively through [`platform::Platform`].
//!
//! The crate builds for two worlds: the real kernel target
//! (`target_os = "none"`, where page tables are live hardware state) and a
//! hosted mode used by the test suite, where physical memory is an emulated
//! arena and TLB/IPI traffic is recorded instead of executed. The paging,
//! allocation and fault logic is identical in both.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod layout;
pub mod log;
pub mod memory;
pub mod platform;
