// src/arch/x86_64/trap_frame.rs
//! Trap frame layout
//!
//! Every trap on this kernel, syscall or hardware-originated, is described by
//! one [`TrapFrame`]. The upper five words are exactly what `iretq` consumes,
//! and the error-code word below them is what a hardware exception with an
//! error code pushes, so a syscall-synthesized frame and a hardware frame are
//! indistinguishable to the consumer.
//!
//! ```text
//! 0x00..0x78  general-purpose registers (r15 first, rax last)
//! 0x78        error code (0 for syscalls)
//! 0x80        RIP
//! 0x88        CS
//! 0x90        RFLAGS
//! 0x98        RSP
//! 0xA0        SS
//! ```

use core::fmt;

use x86_64::registers::rflags::RFlags;

use super::gdt;

/// Offsets into [`TrapFrame`] used by the trampoline.
/// These MUST match the actual struct layout!
pub mod offset {
    /// `gprs.r15`, the lowest slot
    pub const R15: usize = 0x00;
    /// `gprs.r11`, zeroed on syscall entry
    pub const R11: usize = 0x20;
    /// `gprs.r10`
    pub const R10: usize = 0x28;
    /// `gprs.rdi`, first syscall argument
    pub const RDI: usize = 0x48;
    /// `gprs.rcx`, zeroed on syscall entry
    pub const RCX: usize = 0x60;
    /// `gprs.rax`, syscall number and result
    pub const RAX: usize = 0x70;
    /// Error code
    pub const ERROR_CODE: usize = 0x78;
    /// Resume address
    pub const RIP: usize = 0x80;
    /// Code segment selector
    pub const CS: usize = 0x88;
    /// Saved flags
    pub const RFLAGS: usize = 0x90;
    /// Stack pointer to resume with
    pub const RSP: usize = 0x98;
    /// Stack segment selector
    pub const SS: usize = 0xA0;
    /// Total frame size
    pub const SIZE: usize = 0xA8;
}

/// Number of general-purpose registers held in a frame (all but RSP).
pub const GPR_COUNT: usize = 15;

/// General-purpose register snapshot, in the order the entry stubs push it.
#[allow(missing_docs)]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneralPurposeRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

/// The five words `iretq` pops, lowest address first.
#[allow(missing_docs)]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InterruptReturnFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// x86_64 trap frame shared by syscalls, exceptions and interrupts.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame {
    /// Caller registers; RCX and R11 are recorded as 0 for syscalls.
    pub gprs: GeneralPurposeRegisters,
    /// Error code slot.
    pub error_code: u64,
    /// Hardware interrupt-return frame.
    pub iret: InterruptReturnFrame,
}

// Compile-time layout verification
const _: () = {
    use core::mem::{offset_of, size_of};

    assert!(offset_of!(TrapFrame, gprs) + offset_of!(GeneralPurposeRegisters, r15) == offset::R15);
    assert!(offset_of!(TrapFrame, gprs) + offset_of!(GeneralPurposeRegisters, r11) == offset::R11);
    assert!(offset_of!(TrapFrame, gprs) + offset_of!(GeneralPurposeRegisters, r10) == offset::R10);
    assert!(offset_of!(TrapFrame, gprs) + offset_of!(GeneralPurposeRegisters, rdi) == offset::RDI);
    assert!(offset_of!(TrapFrame, gprs) + offset_of!(GeneralPurposeRegisters, rcx) == offset::RCX);
    assert!(offset_of!(TrapFrame, gprs) + offset_of!(GeneralPurposeRegisters, rax) == offset::RAX);
    assert!(offset_of!(TrapFrame, error_code) == offset::ERROR_CODE);
    assert!(offset_of!(TrapFrame, iret) + offset_of!(InterruptReturnFrame, rip) == offset::RIP);
    assert!(offset_of!(TrapFrame, iret) + offset_of!(InterruptReturnFrame, cs) == offset::CS);
    assert!(offset_of!(TrapFrame, iret) + offset_of!(InterruptReturnFrame, rflags) == offset::RFLAGS);
    assert!(offset_of!(TrapFrame, iret) + offset_of!(InterruptReturnFrame, rsp) == offset::RSP);
    assert!(offset_of!(TrapFrame, iret) + offset_of!(InterruptReturnFrame, ss) == offset::SS);
    assert!(size_of::<GeneralPurposeRegisters>() == GPR_COUNT * 8);
    assert!(size_of::<TrapFrame>() == offset::SIZE);
};

/// Privilege context a trap came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Ring 3, canonical-low address space.
    User,
    /// Ring 0, canonical-high address space.
    Kernel,
}

impl Origin {
    /// Classify a resume address by its top 16 bits.
    ///
    /// All-zero top bits is user space; anything else is treated as kernel
    /// space. Non-canonical addresses are never produced by `syscall` and are
    /// not checked for.
    #[must_use]
    pub const fn classify(return_address: u64) -> Self {
        if return_address >> 48 == 0 {
            Origin::User
        } else {
            Origin::Kernel
        }
    }

    /// Classify a saved code selector by its RPL.
    #[must_use]
    pub const fn from_code_selector(cs: u64) -> Self {
        if cs & 0b11 == 0 {
            Origin::Kernel
        } else {
            Origin::User
        }
    }

    /// Code selector the frame resumes with.
    #[must_use]
    pub const fn code_selector(self) -> u16 {
        match self {
            Origin::User => gdt::USER_CODE,
            Origin::Kernel => gdt::KERNEL_CODE,
        }
    }

    /// Stack selector the frame resumes with.
    #[must_use]
    pub const fn stack_selector(self) -> u16 {
        match self {
            Origin::User => gdt::USER_DATA,
            Origin::Kernel => gdt::KERNEL_DATA,
        }
    }
}

impl TrapFrame {
    /// An all-zero frame.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            gprs: GeneralPurposeRegisters {
                r15: 0,
                r14: 0,
                r13: 0,
                r12: 0,
                r11: 0,
                r10: 0,
                r9: 0,
                r8: 0,
                rsi: 0,
                rdi: 0,
                rbp: 0,
                rdx: 0,
                rcx: 0,
                rbx: 0,
                rax: 0,
            },
            error_code: 0,
            iret: InterruptReturnFrame {
                rip: 0,
                cs: 0,
                rflags: 0,
                rsp: 0,
                ss: 0,
            },
        }
    }

    /// Frame that starts a user thread at `rip` with stack `rsp`.
    ///
    /// Interrupts are enabled once the frame is launched.
    #[must_use]
    pub const fn new_user(rip: u64, rsp: u64) -> Self {
        Self::with_origin(Origin::User, rip, rsp)
    }

    /// Frame that resumes kernel code at `rip` on stack `rsp`.
    #[must_use]
    pub const fn new_kernel(rip: u64, rsp: u64) -> Self {
        Self::with_origin(Origin::Kernel, rip, rsp)
    }

    const fn with_origin(origin: Origin, rip: u64, rsp: u64) -> Self {
        let mut frame = Self::zeroed();
        frame.iret.rip = rip;
        frame.iret.cs = origin.code_selector() as u64;
        frame.iret.rflags = RFlags::INTERRUPT_FLAG.bits() | 0x2;
        frame.iret.rsp = rsp;
        frame.iret.ss = origin.stack_selector() as u64;
        frame
    }

    /// Privilege context this frame resumes into.
    #[must_use]
    pub const fn origin(&self) -> Origin {
        Origin::from_code_selector(self.iret.cs)
    }

    /// Syscall number (RAX at entry).
    #[must_use]
    pub const fn syscall_number(&self) -> u64 {
        self.gprs.rax
    }

    /// The six syscall arguments in ABI order: RDI, RSI, RDX, R10, R8, R9.
    #[must_use]
    pub const fn syscall_args(&self) -> [u64; 6] {
        [
            self.gprs.rdi,
            self.gprs.rsi,
            self.gprs.rdx,
            self.gprs.r10,
            self.gprs.r8,
            self.gprs.r9,
        ]
    }

    /// Store a syscall result; negative values are errno codes.
    pub fn set_result(&mut self, value: i64) {
        self.gprs.rax = value as u64;
    }

    /// The result register as a signed value.
    #[must_use]
    pub const fn result(&self) -> i64 {
        self.gprs.rax as i64
    }

    /// Error code pushed by hardware, or 0 for syscalls.
    #[must_use]
    pub const fn error_code(&self) -> u64 {
        self.error_code
    }

    /// Resume address.
    pub fn rip(&mut self) -> &mut u64 {
        &mut self.iret.rip
    }

    /// Stack pointer to resume with.
    pub fn rsp(&mut self) -> &mut u64 {
        &mut self.iret.rsp
    }

    /// Saved flags.
    #[must_use]
    pub const fn rflags(&self) -> RFlags {
        RFlags::from_bits_retain(self.iret.rflags)
    }
}

impl Default for TrapFrame {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = &self.gprs;
        write!(
            f,
            "RAX: {:016x} | RBX: {:016x} | RCX: {:016x} | RDX: {:016x}\n\
             RSI: {:016x} | RDI: {:016x} | RBP: {:016x} | RSP: {:016x}\n\
             R8 : {:016x} | R9 : {:016x} | R10: {:016x} | R11: {:016x}\n\
             R12: {:016x} | R13: {:016x} | R14: {:016x} | R15: {:016x}\n\
             RIP: {:016x} | Error Code: {:#x} | RFLAGS: {:016x}\n\
             CS:  {:#06x} | SS: {:#06x} ({:?})",
            g.rax,
            g.rbx,
            g.rcx,
            g.rdx,
            g.rsi,
            g.rdi,
            g.rbp,
            self.iret.rsp,
            g.r8,
            g.r9,
            g.r10,
            g.r11,
            g.r12,
            g.r13,
            g.r14,
            g.r15,
            self.iret.rip,
            self.error_code,
            self.iret.rflags,
            self.iret.cs,
            self.iret.ss,
            self.origin(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};
    use x86_64::structures::idt::InterruptStackFrameValue;

    #[test]
    fn classify_by_top_bits() {
        assert_eq!(Origin::classify(0x0000_0000_0000_4010), Origin::User);
        assert_eq!(Origin::classify(0x0000_7FFF_FFFF_F000), Origin::User);
        assert_eq!(Origin::classify(0xFFFF_8000_0000_0000), Origin::Kernel);
        assert_eq!(Origin::classify(0xFFFF_FFFF_8020_1000), Origin::Kernel);
    }

    #[test]
    fn selector_rpl_matches_origin() {
        assert_eq!(Origin::from_code_selector(u64::from(gdt::USER_CODE)), Origin::User);
        assert_eq!(Origin::from_code_selector(u64::from(gdt::KERNEL_CODE)), Origin::Kernel);
    }

    #[test]
    fn iret_half_matches_hardware_frame() {
        // The x86_64 crate's view of what the CPU pushes on an interrupt.
        assert_eq!(size_of::<InterruptReturnFrame>(), size_of::<InterruptStackFrameValue>());
        assert_eq!(
            offset_of!(InterruptReturnFrame, rip),
            offset_of!(InterruptStackFrameValue, instruction_pointer)
        );
        assert_eq!(
            offset_of!(InterruptReturnFrame, cs),
            offset_of!(InterruptStackFrameValue, code_segment)
        );
        assert_eq!(
            offset_of!(InterruptReturnFrame, rflags),
            offset_of!(InterruptStackFrameValue, cpu_flags)
        );
        assert_eq!(
            offset_of!(InterruptReturnFrame, rsp),
            offset_of!(InterruptStackFrameValue, stack_pointer)
        );
        assert_eq!(
            offset_of!(InterruptReturnFrame, ss),
            offset_of!(InterruptStackFrameValue, stack_segment)
        );
    }

    #[test]
    fn user_frame_defaults() {
        let frame = TrapFrame::new_user(0x40_0000, 0x7FFF_FFFF_E000);
        assert_eq!(frame.origin(), Origin::User);
        assert_eq!(frame.iret.ss, u64::from(gdt::USER_DATA));
        assert!(frame.rflags().contains(RFlags::INTERRUPT_FLAG));
        assert_eq!(frame.error_code(), 0);
        assert_eq!(frame.gprs, GeneralPurposeRegisters::default());
    }

    #[test]
    fn syscall_accessors() {
        let mut frame = TrapFrame::new_kernel(0xFFFF_8000_0000_1000, 0xFFFF_8000_0010_0000);
        frame.gprs.rax = 9;
        frame.gprs.rdi = 1;
        frame.gprs.rsi = 2;
        frame.gprs.rdx = 3;
        frame.gprs.r10 = 4;
        frame.gprs.r8 = 5;
        frame.gprs.r9 = 6;
        assert_eq!(frame.syscall_number(), 9);
        assert_eq!(frame.syscall_args(), [1, 2, 3, 4, 5, 6]);

        frame.set_result(-38);
        assert_eq!(frame.result(), -38);
        assert_eq!(frame.gprs.rax, (-38i64) as u64);

        *frame.rip() += 2;
        assert_eq!(frame.iret.rip, 0xFFFF_8000_0000_1002);
    }
}
