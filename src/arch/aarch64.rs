//! AArch64 interrupt masking through the DAIF register.

use super::Arch;
use core::arch::asm;

/// AArch64 implementation (Raspberry Pi class Cortex-A cores).
pub struct Aarch64Arch;

impl Arch for Aarch64Arch {
    fn enable_interrupts() {
        unsafe {
            asm!(
                "msr daifclr, #2",
                options(nomem, nostack)
            );
        }
    }

    fn disable_interrupts() {
        unsafe {
            asm!(
                "msr daifset, #2",
                options(nomem, nostack)
            );
        }
    }

    fn interrupts_enabled() -> bool {
        let daif: u64;
        unsafe {
            asm!(
                "mrs {daif}, daif",
                daif = out(reg) daif,
                options(nostack, readonly)
            );
        }
        (daif & 0x80) == 0
    }

    fn wait_for_interrupt() {
        unsafe {
            asm!("wfi", options(nomem, nostack));
        }
    }
}
