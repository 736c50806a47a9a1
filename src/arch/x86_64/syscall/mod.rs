// src/arch/x86_64/syscall/mod.rs
//! System Call Mechanism for `x86_64`
//!
//! `syscall` gives the kernel nothing but RCX (resume address) and R11
//! (caller RFLAGS); it does not switch stacks and does not push a frame.
//! [`syscall_entry`] turns that into the same [`TrapFrame`] a hardware
//! exception with an error code produces, hands it to the trap consumer and
//! leaves through `iretq`, so syscalls, exceptions and interrupts share one
//! return path ([`trap_return`]).
//!
//! # Entry contexts
//!
//! - **User origin** (resume address canonical-low): switch to RSP0 from the
//!   CPU's TSS, `swapgs` in and out.
//! - **Kernel origin** (resume address canonical-high, used by ring-0
//!   self-tests): stay on the caller's stack, no `swapgs`. The caller must
//!   not keep live data in a red zone.
//!
//! # Stack on `call` into the consumer
//!
//! ```text
//!   SS      user_data | kernel_data
//!   RSP     caller RSP (from scratch_rsp)
//!   RFLAGS  R11
//!   ---- sti ----
//!   CS      user_code | kernel_code
//!   RIP     RCX
//!   0       error code
//!   rax rbx 0(rcx) rdx rbp rdi rsi r8 r9 r10 0(r11) r12 r13 r14 r15
//!   ^ frame (published to active_frame, passed in RDI)
//! ```

use core::arch::naked_asm;

use x86_64::VirtAddr;
use x86_64::registers::model_specific::{Efer, EferFlags, LStar, Msr, SFMask};

use crate::config::SYSCALL_FLAG_MASK;
use crate::errors::SyscallInitError;
use crate::kernel::trap::dispatch_syscall_trap;

use super::gdt;
use super::per_cpu::{self, offset as ptb};
use super::trap_frame::{TrapFrame, offset as frame};
use super::tss::RSP0_OFFSET;

/// STAR MSR
const IA32_STAR: u32 = 0xC000_0081;

/// Initialize the syscall mechanism on the calling CPU.
///
/// Enables SCE in EFER and programs STAR, LSTAR and SFMASK. The CPU's
/// transition block must already be initialized ([`per_cpu::init`]).
///
/// # Errors
///
/// - `PerCpuNotReady` if `cpu`'s block is not bound.
/// - `InvalidStarSelectors` if the GDT layout breaks SYSCALL/SYSRET rules.
pub fn init(cpu: usize) -> Result<(), SyscallInitError> {
    let bound = per_cpu::get(cpu)
        .ok()
        .and_then(per_cpu::TransitionBlock::cpu_index)
        .is_some();
    if !bound {
        return Err(SyscallInitError::PerCpuNotReady);
    }
    gdt::validate_star_layout().map_err(SyscallInitError::InvalidStarSelectors)?;

    let star = gdt::star_value();
    let entry = syscall_entry as *const () as u64;

    // SAFETY: ring 0. The entry point is a naked function that never
    // returns to its caller, and the selector layout was validated above.
    #[allow(unused_unsafe)]
    unsafe {
        Efer::update(|flags| {
            *flags |= EferFlags::SYSTEM_CALL_EXTENSIONS;
        });
        Msr::new(IA32_STAR).write(star);
        LStar::write(VirtAddr::new(entry));
        SFMask::write(SYSCALL_FLAG_MASK);
    }

    log::info!("[OK] Syscall mechanism initialized on CPU {}", cpu);
    log::debug!("  STAR:   {:#018x}", star);
    log::debug!("  LSTAR:  {:#x}", entry);
    log::debug!("  SFMASK: {:?}", SYSCALL_FLAG_MASK);
    Ok(())
}

/// Entry half of the trampoline, as one template.
///
/// Operands: `scratch_rsp`, `scratch_r14`, `tss_ptr`, `active_frame`, `rsp0`,
/// `user_ss`, `user_cs`, `kernel_ss`, `kernel_cs`, `frame_rdi` (const) and
/// `dispatch`, `trap_return` (sym). The instruction-level tests execute this
/// same text.
macro_rules! entry_half {
    () => {
        concat!(
            // Bit 63 agrees with the top 16 bits for every canonical RCX; it
            // picks the GS base while no register is free yet.
            "test rcx, rcx\n",
            "js 2f\n",
            "swapgs\n",
            "2:\n",
            // Step 1: back up caller RSP and R14.
            "mov qword ptr gs:[{scratch_rsp}], rsp\n",
            "mov qword ptr gs:[{scratch_r14}], r14\n",
            // Step 2: classify by the top 16 bits of the resume address.
            "mov r14, rcx\n",
            "shr r14, 48\n",
            "jnz 3f\n",
            // User origin: RSP0 from this CPU's TSS.
            "mov rsp, qword ptr gs:[{tss_ptr}]\n",
            "mov rsp, qword ptr [rsp + {rsp0}]\n",
            // Step 3: outer half of the hardware frame.
            "push {user_ss}\n",
            "push qword ptr gs:[{scratch_rsp}]\n",
            "push r11\n",
            // Scratch slots are consumed before interrupts can run.
            "mov r14, qword ptr gs:[{scratch_r14}]\n",
            // Step 4.
            "sti\n",
            // Step 5.
            "push {user_cs}\n",
            "jmp 4f\n",
            // Kernel origin: build the frame on the caller's stack.
            "3:\n",
            "push {kernel_ss}\n",
            "push qword ptr gs:[{scratch_rsp}]\n",
            "push r11\n",
            "mov r14, qword ptr gs:[{scratch_r14}]\n",
            "sti\n",
            "push {kernel_cs}\n",
            "4:\n",
            "push rcx\n",
            "push 0\n",
            // General-purpose snapshot. RCX and R11 hold the CPU's return
            // state, not caller values: record them as zero.
            "push rax\n",
            "push rbx\n",
            "push 0\n",
            "push rdx\n",
            "push rbp\n",
            "push rdi\n",
            "push rsi\n",
            "push r8\n",
            "push r9\n",
            "push r10\n",
            "push 0\n",
            "push r12\n",
            "push r13\n",
            "push r14\n",
            "push r15\n",
            // Step 6: publish, then call the consumer on a 16-byte aligned stack.
            "mov qword ptr gs:[{active_frame}], rsp\n",
            "mov rdi, rsp\n",
            "mov rsi, qword ptr [rsp + {frame_rdi}]\n",
            "mov rbx, rsp\n",
            "and rsp, -16\n",
            "call {dispatch}\n",
            "mov rsp, rbx\n",
            "jmp {trap_return}\n",
        )
    };
}

/// Return half, as one template.
///
/// Operands: `active_frame`, `cs` (const).
macro_rules! return_half {
    () => {
        concat!(
            "cli\n",
            "mov qword ptr gs:[{active_frame}], 0\n",
            "pop r15\n",
            "pop r14\n",
            "pop r13\n",
            "pop r12\n",
            "pop r11\n",
            "pop r10\n",
            "pop r9\n",
            "pop r8\n",
            "pop rsi\n",
            "pop rdi\n",
            "pop rbp\n",
            "pop rdx\n",
            "pop rcx\n",
            "pop rbx\n",
            "pop rax\n",
            // Error code.
            "add rsp, 8\n",
            "test qword ptr [rsp + {cs}], 3\n",
            "jz 2f\n",
            "swapgs\n",
            "2:\n",
            "iretq\n",
        )
    };
}

/// Body of [`launch`]. Operand: `trap_return` (sym).
macro_rules! launch_body {
    () => {
        concat!("mov rsp, rdi\n", "jmp {trap_return}\n")
    };
}

/// Syscall entry point (LSTAR target).
///
/// Register state on entry:
/// - RAX: syscall number
/// - RDI, RSI, RDX, R10, R8, R9: arguments 1-6
/// - RCX: resume RIP (saved by CPU)
/// - R11: caller RFLAGS (saved by CPU)
/// - RSP: **still the caller's stack**
/// - IF clear (SFMASK)
///
/// The consumer reads everything from the frame; on return every register
/// is reloaded from it, RCX and R11 included.
///
/// # Safety
///
/// Only the CPU may enter this function, via `syscall`.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    naked_asm!(
        entry_half!(),
        scratch_rsp = const ptb::SCRATCH_RSP,
        scratch_r14 = const ptb::SCRATCH_R14,
        tss_ptr = const ptb::TSS_PTR,
        active_frame = const ptb::ACTIVE_FRAME,
        rsp0 = const RSP0_OFFSET,
        user_ss = const gdt::USER_DATA,
        user_cs = const gdt::USER_CODE,
        kernel_ss = const gdt::KERNEL_DATA,
        kernel_cs = const gdt::KERNEL_CODE,
        frame_rdi = const frame::RDI,
        dispatch = sym dispatch_syscall_trap,
        trap_return = sym trap_return,
    );
}

/// Common return half.
///
/// RSP must point at a complete [`TrapFrame`]. Clears the active-frame
/// field, reloads every general-purpose register from the frame, drops the
/// error code and leaves with `iretq`. `swapgs` runs only when the frame
/// resumes in ring 3.
#[unsafe(naked)]
unsafe extern "C" fn trap_return() -> ! {
    naked_asm!(
        return_half!(),
        active_frame = const ptb::ACTIVE_FRAME,
        cs = const frame::CS - frame::RIP,
    );
}

/// Enter the context described by `frame` through the trap return path.
///
/// Used to start user threads: build a frame with
/// [`TrapFrame::new_user`] and launch it.
///
/// # Safety
///
/// - `frame` must stay valid until the `iretq` has consumed it and must not
///   overlap the current stack.
/// - The caller must have released every lock and guard it holds; this
///   function never returns.
/// - For a ring-3 frame, RSP0 in this CPU's TSS must point at a valid
///   kernel stack.
#[unsafe(naked)]
pub unsafe extern "C" fn launch(frame: *const TrapFrame) -> ! {
    naked_asm!(
        launch_body!(),
        trap_return = sym trap_return,
    );
}
