// qemu/tests/transitions.rs
//! Privilege transitions on a real CPU
//!
//! Boots under QEMU, brings the CPU up with `init_cpu`, then drives the
//! trampoline with real `syscall` instructions: the kernel-origin self-test,
//! an ordinary ring-0 syscall, and a ring-3 program started with `launch`.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(tiny_gate_qemu::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::arch::asm;
use core::panic::PanicInfo;
use core::sync::atomic::{AtomicU64, Ordering};

use bootloader_api::{BootInfo, entry_point};
use spin::{Mutex, Once};
use tiny_gate::arch::x86_64::syscall::{launch, syscall_entry};
use tiny_gate::arch::x86_64::{Origin, TrapFrame, gdt, per_cpu, selftest};
use tiny_gate::config::SYSCALL_FLAG_MASK;
use tiny_gate::kernel::trap;
use tiny_gate_qemu::memory::map_user_page;
use x86_64::VirtAddr;
use x86_64::registers::model_specific::{Efer, EferFlags, LStar, Msr, SFMask};
use x86_64::registers::rflags::RFlags;

entry_point!(test_kernel_main, config = &tiny_gate_qemu::BOOTLOADER_CONFIG);

static CPU: Once<usize> = Once::new();

fn test_kernel_main(boot_info: &'static mut BootInfo) -> ! {
    let cpu = tiny_gate_qemu::boot(boot_info);
    CPU.call_once(|| cpu);
    trap::register_consumer(&round_trip_consumer).expect("consumer registered twice");
    test_main();
    tiny_gate_qemu::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    tiny_gate_qemu::test_panic_handler(info)
}

/// Record the frame, answer `RECORD_RESULT`.
const RECORD: u64 = 1;
/// Record the frame, resume the kernel where it launched the user program.
const COME_HOME: u64 = 2;
const RECORD_RESULT: i64 = 0x77;

const USER_CODE_ADDR: u64 = 0x0000_1000_0000_0000;
const USER_STACK_PAGE: u64 = 0x0000_1000_0001_0000;
const USER_STACK_TOP: u64 = USER_STACK_PAGE + 4096;

/// Offsets of the two resume points inside `USER_PROGRAM`.
const AFTER_FIRST_SYSCALL: u64 = 7;
const AFTER_SECOND_SYSCALL: u64 = 17;

const USER_PROGRAM: [u8; 19] = [
    0xB8, 0x01, 0x00, 0x00, 0x00, // mov eax, RECORD
    0x0F, 0x05, // syscall
    0x49, 0x89, 0xC4, // mov r12, rax
    0xB8, 0x02, 0x00, 0x00, 0x00, // mov eax, COME_HOME
    0x0F, 0x05, // syscall
    0xEB, 0xFE, // jmp $
];

static SEEN: Mutex<[Option<TrapFrame>; 2]> = Mutex::new([None; 2]);
static KERNEL_RSP: AtomicU64 = AtomicU64::new(0);
static KERNEL_RESUME: AtomicU64 = AtomicU64::new(0);

fn round_trip_consumer(frame: &mut TrapFrame, _first_arg: u64) {
    match frame.syscall_number() {
        RECORD => {
            SEEN.lock()[0] = Some(*frame);
            frame.set_result(RECORD_RESULT);
        }
        COME_HOME => {
            SEEN.lock()[1] = Some(*frame);
            *frame.rip() = KERNEL_RESUME.load(Ordering::Acquire);
            *frame.rsp() = KERNEL_RSP.load(Ordering::Acquire);
            frame.iret.cs = u64::from(gdt::KERNEL_CODE);
            frame.iret.ss = u64::from(gdt::KERNEL_DATA);
            frame.iret.rflags = 0x2;
        }
        _ => frame.set_result(-trap::ENOSYS),
    }
}

fn assert_cpu_state_zeroed(frame: &TrapFrame) {
    assert_eq!(frame.gprs.rcx, 0, "RCX slot");
    assert_eq!(frame.gprs.r11, 0, "R11 slot");
    assert_eq!(frame.error_code(), 0, "error code");
}

#[test_case]
fn msrs_point_at_the_trampoline() {
    assert!(Efer::read().contains(EferFlags::SYSTEM_CALL_EXTENSIONS));
    assert_eq!(LStar::read().as_u64(), syscall_entry as *const () as u64);
    // SAFETY: reading STAR in ring 0 has no side effects.
    assert_eq!(unsafe { Msr::new(0xC000_0081).read() }, gdt::star_value());
    assert_eq!(SFMask::read(), SYSCALL_FLAG_MASK);
}

#[test_case]
fn kernel_origin_self_test() {
    assert_eq!(selftest::kernel_origin_roundtrip(), Ok(()));
}

#[test_case]
fn kernel_syscall_reaches_consumer() {
    *SEEN.lock() = [None; 2];
    let result: u64;
    let r12_after: u64;
    // SAFETY: ring 0 after bring-up; the frame is built below RSP.
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") RECORD => result,
            inlateout("r12") 0x1212_u64 => r12_after,
            out("rcx") _,
            out("r11") _,
        );
    }
    assert_eq!(result, RECORD_RESULT as u64);
    assert_eq!(r12_after, 0x1212);

    let frame = SEEN.lock()[0].expect("consumer never saw the kernel syscall");
    assert_eq!(frame.origin(), Origin::Kernel);
    assert_eq!(frame.iret.cs, u64::from(gdt::KERNEL_CODE));
    assert_eq!(frame.iret.ss, u64::from(gdt::KERNEL_DATA));
    assert_cpu_state_zeroed(&frame);
}

#[test_case]
fn user_program_round_trip() {
    map_user_page(VirtAddr::new(USER_CODE_ADDR), &USER_PROGRAM, false).expect("map user code");
    map_user_page(VirtAddr::new(USER_STACK_PAGE), &[], true).expect("map user stack");
    *SEEN.lock() = [None; 2];

    let mut frame = TrapFrame::new_user(USER_CODE_ADDR, USER_STACK_TOP);
    frame.gprs.rdx = 0xD0D0_0000_0000_0003;
    frame.gprs.rsi = 0x5151_0000_0000_0002;
    frame.gprs.r13 = 0x1313_0000_0000_0013;
    frame.gprs.r14 = 0x1414_0000_0000_0014;
    frame.gprs.r15 = 0x1515_0000_0000_0015;
    let frame_ptr = core::ptr::from_ref(&frame);

    let (r12, r13, r14, r15): (u64, u64, u64, u64);
    // SAFETY: ring 0 with RSP0 set by bring-up. The frame outlives the
    // launch, and the COME_HOME consumer resumes at label 2 with the RSP
    // saved here, so the pushes and pops pair up.
    unsafe {
        asm!(
            "push rbx",
            "push rbp",
            "mov qword ptr [rip + {kernel_rsp}], rsp",
            "lea rax, [rip + 2f]",
            "mov qword ptr [rip + {kernel_resume}], rax",
            "call {launch}",
            "2:",
            "pop rbp",
            "pop rbx",
            kernel_rsp = sym KERNEL_RSP,
            kernel_resume = sym KERNEL_RESUME,
            launch = sym launch,
            in("rdi") frame_ptr,
            out("r12") r12,
            out("r13") r13,
            out("r14") r14,
            out("r15") r15,
            clobber_abi("C"),
        );
    }

    let [first, second] = *SEEN.lock();
    let first = first.expect("first user syscall never reached the consumer");
    let second = second.expect("second user syscall never reached the consumer");

    assert_eq!(first.origin(), Origin::User);
    assert_eq!(first.iret.cs, u64::from(gdt::USER_CODE));
    assert_eq!(first.iret.ss, u64::from(gdt::USER_DATA));
    assert_eq!(first.iret.rip, USER_CODE_ADDR + AFTER_FIRST_SYSCALL);
    assert_eq!(first.iret.rsp, USER_STACK_TOP);
    assert!(first.rflags().contains(RFlags::INTERRUPT_FLAG));
    assert_eq!(first.gprs.rdx, 0xD0D0_0000_0000_0003);
    assert_eq!(first.gprs.rsi, 0x5151_0000_0000_0002);
    assert_cpu_state_zeroed(&first);

    // The result of the first syscall reached user code.
    assert_eq!(second.gprs.r12, RECORD_RESULT as u64);
    assert_eq!(second.iret.rip, USER_CODE_ADDR + AFTER_SECOND_SYSCALL);
    assert_eq!(second.gprs.r13, 0x1313_0000_0000_0013);
    assert_cpu_state_zeroed(&second);

    assert_eq!(r12, RECORD_RESULT as u64);
    assert_eq!((r13, r14, r15), (0x1313_0000_0000_0013, 0x1414_0000_0000_0014, 0x1515_0000_0000_0015));

    // Back in ring 0 with the kernel GS base and nothing in flight.
    // SAFETY: bring-up ran on this CPU and the return did not swapgs.
    let block = unsafe { per_cpu::current() };
    assert_eq!(block.cpu_index(), CPU.get().copied());
    assert!(block.active_frame().is_none());
}
