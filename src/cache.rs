//! Instruction cache maintenance for text patching.

use core::sync::atomic::{Ordering, fence};

/// Make a text modification in `[start, end)` visible to instruction fetch.
///
/// x86 keeps instruction and data caches coherent, so a serializing fence
/// orders the patch store before later fetches on this CPU. Other targets
/// only get a full fence; the scanner never produces sites for them.
pub fn flush_icache_range(start: usize, end: usize) {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    // SAFETY: mfence has no operands and no side effects beyond ordering.
    unsafe {
        core::arch::asm!("mfence", options(nostack, preserves_flags));
    }
    fence(Ordering::SeqCst);
    trace!("fbt: icache sync {:#x}..{:#x}", start, end);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_is_repeatable() {
        for addr in (0x1000..0x1100).step_by(8) {
            flush_icache_range(addr, addr + 1);
        }
    }
}
