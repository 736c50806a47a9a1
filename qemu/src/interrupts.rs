//! Fault handlers for the harness.
//!
//! Any CPU exception while a test runs is a failure: report it, including
//! the trap frame the trampoline was handling, and leave QEMU.

use spin::Once;
use tiny_gate::debug_println;
use x86_64::PrivilegeLevel;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::qemu::{QemuExitCode, exit_qemu};

static IDT: Once<InterruptDescriptorTable> = Once::new();

/// Build and load the IDT.
pub fn load_fault_handlers() {
    let idt = IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.double_fault.set_handler_fn(double_fault_handler);
        idt
    });
    idt.load();
}

fn fail(what: &str, frame: &InterruptStackFrame, error_code: u64) -> ! {
    debug_println!("[FAULT] {} (error code {:#x})\n{:#?}", what, error_code, frame);
    if frame.code_segment.rpl() == PrivilegeLevel::Ring0 {
        // SAFETY: the fault came from ring 0 after bring-up, so GS holds the
        // kernel base.
        unsafe { tiny_gate::kernel::trap::report_active_frame() };
    }
    exit_qemu(QemuExitCode::Failed);
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    fail("invalid opcode", &frame, 0);
}

extern "x86-interrupt" fn general_protection_fault_handler(frame: InterruptStackFrame, code: u64) {
    fail("general protection fault", &frame, code);
}

extern "x86-interrupt" fn page_fault_handler(frame: InterruptStackFrame, code: PageFaultErrorCode) {
    debug_println!("[FAULT] accessed address: {:?}", Cr2::read());
    fail("page fault", &frame, code.bits());
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, code: u64) -> ! {
    fail("double fault", &frame, code);
}
