//! x86_64 control-state access for the memory core.

#[cfg(target_os = "none")]
pub mod serial;

#[cfg(target_os = "none")]
mod control {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::registers::model_specific::{Efer, EferFlags, Msr};
    use x86_64::structures::paging::PhysFrame;
    use x86_64::PhysAddr;

    use crate::memory::addr::CpuWidths;

    /// IA32_PAT; slot 4 is reprogrammed to write-combining at boot.
    const IA32_PAT: u32 = 0x277;
    const PAT_WRITE_COMBINING: u64 = 0x01;

    /// Address widths from CPUID leaf 0x8000_0008 (EAX[7:0] physical,
    /// EAX[15:8] linear).
    pub fn probe_cpu_widths() -> CpuWidths {
        let leaf = unsafe { core::arch::x86_64::__cpuid(0x8000_0008) };
        CpuWidths {
            phys: (leaf.eax & 0xff) as u8,
            virt: ((leaf.eax >> 8) & 0xff) as u8,
        }
    }

    /// Drop one translation from the local TLB.
    #[inline]
    pub fn invlpg(virt: u64) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) virt, options(nostack, preserves_flags));
        }
    }

    /// Full local flush (CR3 reload); non-global entries only.
    #[inline]
    pub fn flush_tlb_all() {
        x86_64::instructions::tlb::flush_all();
    }

    /// Switch the running core onto `pml4_phys`.
    ///
    /// # Safety
    /// The table must map the currently-executing code and stack.
    pub unsafe fn load_root(pml4_phys: u64) {
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(pml4_phys)),
            Cr3Flags::empty(),
        );
    }

    /// Turn on EFER.NXE so the no-execute PTE bit is honoured.
    pub fn enable_no_execute() {
        unsafe {
            Efer::update(|flags| *flags |= EferFlags::NO_EXECUTE_ENABLE);
        }
    }

    /// Point PAT slot 4 at write-combining; leaves the architectural
    /// defaults in slots 0-3 untouched. A leaf selects slot 4 with
    /// {PAT=1, PCD=0, PWT=0}.
    pub fn program_pat() {
        let mut pat = Msr::new(IA32_PAT);
        unsafe {
            let mut value = pat.read();
            value &= !(0xff << 32);
            value |= PAT_WRITE_COMBINING << 32;
            pat.write(value);
        }
    }
}

#[cfg(target_os = "none")]
pub use control::{
    enable_no_execute, flush_tlb_all, invlpg, load_root, probe_cpu_widths, program_pat,
};
