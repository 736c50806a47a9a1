// src/config.rs
//! Build-time configuration for the transition core.

use x86_64::registers::rflags::RFlags;

/// Number of per-CPU transition blocks and task-state slots.
pub const MAX_CPUS: usize = 64;

/// RFLAGS bits the CPU clears on `syscall` (written to SFMASK).
///
/// IF must be in this set: the trampoline runs with interrupts off until the
/// outer half of the frame is on a stack it owns.
pub const SYSCALL_FLAG_MASK: RFlags = RFlags::INTERRUPT_FLAG
    .union(RFlags::TRAP_FLAG)
    .union(RFlags::DIRECTION_FLAG)
    .union(RFlags::IOPL_LOW)
    .union(RFlags::IOPL_HIGH)
    .union(RFlags::ALIGNMENT_CHECK)
    .union(RFlags::NESTED_TASK);

/// Reserved syscall number answered by the dispatcher itself for the
/// kernel-origin self-test. Never reaches a registered consumer.
pub const SELF_TEST_SYSCALL: u64 = 0xFFFF_FFFF_5E1F_7E57;

/// Whether syscall tracing was compiled in (`syscall_trace` feature).
pub const SYSCALL_TRACE: bool = cfg!(feature = "syscall_trace");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_mask_clears_interrupts() {
        assert!(SYSCALL_FLAG_MASK.contains(RFlags::INTERRUPT_FLAG));
        assert!(SYSCALL_FLAG_MASK.contains(RFlags::DIRECTION_FLAG));
        // Reserved bit 1 must survive the mask.
        assert_eq!(SYSCALL_FLAG_MASK.bits() & 0x2, 0);
    }

    #[test]
    fn self_test_number_is_not_a_user_syscall() {
        assert!(SELF_TEST_SYSCALL > u64::from(u32::MAX));
    }
}
