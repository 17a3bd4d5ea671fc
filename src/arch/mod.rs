//! Architecture Support
//!
//! On the kernel target these primitives touch real control state (CPUID,
//! `invlpg`, CR3, the PAT MSR). Hosted builds substitute no-ops with fixed
//! CPU widths so the memory core can run under the test harness.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", target_os = "none"))] {
        pub use self::x86_64::{
            enable_no_execute, flush_tlb_all, invlpg, load_root, probe_cpu_widths, program_pat,
        };
    } else {
        use crate::memory::addr::CpuWidths;

        /// Widths reported by every x86-64 part this kernel targets.
        pub fn probe_cpu_widths() -> CpuWidths {
            CpuWidths { phys: 52, virt: 48 }
        }

        pub fn invlpg(_virt: u64) {}

        pub fn flush_tlb_all() {}

        /// # Safety
        /// Hosted stub; never switches translation state.
        pub unsafe fn load_root(_pml4_phys: u64) {}

        pub fn enable_no_execute() {}

        pub fn program_pat() {}
    }
}
