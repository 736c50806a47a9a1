// src/arch/x86_64/tss.rs
//! Task State Segment (TSS) management
//!
//! One TSS per CPU slot. The CPU reads `privilege_stack_table[0]` on a
//! hardware interrupt from ring 3; the syscall trampoline reads the same
//! field through the transition block, so both paths land on one stack.

use core::cell::UnsafeCell;
use core::mem::offset_of;

use x86_64::VirtAddr;
use x86_64::structures::tss::TaskStateSegment;

use crate::config::MAX_CPUS;
use crate::errors::PerCpuError;

/// Byte offset of `privilege_stack_table[0]` (RSP0) inside the TSS.
/// The trampoline loads RSP0 from `[tss_ptr + RSP0_OFFSET]`.
pub const RSP0_OFFSET: usize = 0x04;

const _: () = assert!(offset_of!(TaskStateSegment, privilege_stack_table) == RSP0_OFFSET);

struct TssSlot(UnsafeCell<TaskStateSegment>);

// SAFETY: each slot is written only by its own CPU (or by the boot CPU
// before that CPU is started); the hardware reads it concurrently but never
// writes RSP0.
unsafe impl Sync for TssSlot {}

static TSS_TABLE: [TssSlot; MAX_CPUS] =
    [const { TssSlot(UnsafeCell::new(TaskStateSegment::new())) }; MAX_CPUS];

fn slot(cpu: usize) -> Result<&'static TssSlot, PerCpuError> {
    TSS_TABLE.get(cpu).ok_or(PerCpuError::CpuIndexOutOfRange {
        index: cpu,
        max: MAX_CPUS,
    })
}

/// Shared view of `cpu`'s TSS, for descriptor construction.
///
/// # Errors
///
/// Fails if `cpu` is not a valid slot.
pub fn get(cpu: usize) -> Result<&'static TaskStateSegment, PerCpuError> {
    // SAFETY: the slot lives forever; writers only touch the stack tables
    // through raw pointers below.
    slot(cpu).map(|s| unsafe { &*s.0.get() })
}

/// Raw pointer to `cpu`'s TSS, stored in the transition block.
pub(crate) fn as_ptr(cpu: usize) -> Result<*mut TaskStateSegment, PerCpuError> {
    slot(cpu).map(|s| s.0.get())
}

/// Update the ring-0 stack for `cpu`.
///
/// Called on context switch so that syscalls and interrupts from user mode
/// land on the incoming thread's kernel stack.
///
/// # Safety
///
/// `stack_top` must be the top of a valid, 16-byte aligned kernel stack, and
/// the caller must be `cpu` itself (or `cpu` must not be running yet).
///
/// # Errors
///
/// `CpuIndexOutOfRange` if `cpu` is not a valid slot; the TSS is left
/// untouched.
pub unsafe fn set_privilege_stack(cpu: usize, stack_top: VirtAddr) -> Result<(), PerCpuError> {
    debug_assert!(
        stack_top.is_aligned(16u64),
        "Kernel stack must be 16-byte aligned, got {:#x}",
        stack_top.as_u64()
    );
    let tss = as_ptr(cpu)?;
    // SAFETY: caller guarantees exclusive access for this CPU's slot.
    unsafe {
        (*tss).privilege_stack_table[0] = stack_top;
    }
    log::trace!("[TSS] CPU {} RSP0 = {:#x}", cpu, stack_top.as_u64());
    Ok(())
}

/// Current ring-0 stack for `cpu`.
///
/// # Errors
///
/// Fails if `cpu` is not a valid slot.
pub fn privilege_stack(cpu: usize) -> Result<VirtAddr, PerCpuError> {
    let tss = as_ptr(cpu)?;
    // SAFETY: read of a plain u64 inside a live static; the field is
    // unaligned relative to VirtAddr so read it by value.
    Ok(unsafe { core::ptr::addr_of!((*tss).privilege_stack_table[0]).read_unaligned() })
}
