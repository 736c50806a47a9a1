// qemu/src/lib.rs
//! Tiny Gate QEMU ハーネス
//!
//! 実機相当の環境 (Ring 0、GS ベース、MSR、ページテーブル) で
//! トランポリンを動かすためのブート処理とテストランナーです。
//! テスト本体は `tests/` にあり、`#[test_case]` で登録します。

#![no_std]
#![feature(abi_x86_interrupt)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod interrupts;
pub mod memory;
pub mod qemu;

use core::cell::UnsafeCell;
use core::panic::PanicInfo;

use bootloader_api::BootInfo;
use bootloader_api::BootloaderConfig;
use bootloader_api::config::Mapping;
use tiny_gate::arch::x86_64::{Origin, per_cpu};
use tiny_gate::kernel::{driver::serial, logger};
use tiny_gate::{debug_print, debug_println};
use x86_64::VirtAddr;
use x86_64::instructions::port::Port;

pub use qemu::{QemuExitCode, exit_qemu};

/// Bootloader configuration shared by every harness binary.
///
/// The dynamic range starts in the upper half so the kernel image, its
/// stack and the physical-memory window all have canonical-high addresses,
/// which is what classifies a ring-0 `syscall` as kernel-origin.
pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config.mappings.dynamic_range_start = Some(0xFFFF_8000_0000_0000);
    config
};

const RSP0_STACK_SIZE: usize = 16 * 1024;

#[repr(C, align(16))]
struct Rsp0Stack(UnsafeCell<[u8; RSP0_STACK_SIZE]>);

// SAFETY: only the CPU touches this memory, as the ring-0 stack.
unsafe impl Sync for Rsp0Stack {}

static RSP0_STACK: Rsp0Stack = Rsp0Stack(UnsafeCell::new([0; RSP0_STACK_SIZE]));

/// Bring the boot CPU up for transitions.
///
/// Serial and logging first, then fault handlers, then the per-CPU
/// bring-up the library prescribes. Returns the CPU's slot.
pub fn boot(boot_info: &'static mut BootInfo) -> usize {
    serial::init();
    logger::init(log::LevelFilter::Info).expect("logger installed twice");

    let here = boot as *const () as u64;
    assert_eq!(
        Origin::classify(here),
        Origin::Kernel,
        "harness linked at {:#x}; kernel-origin syscalls need an upper-half kernel",
        here
    );

    mask_legacy_pic();
    interrupts::load_fault_handlers();

    let cpu = per_cpu::claim_current_slot().expect("no free per-CPU slot");
    let rsp0_top = VirtAddr::from_ptr(RSP0_STACK.0.get()) + RSP0_STACK_SIZE as u64;
    // SAFETY: ring 0, first and only bring-up of this CPU; the stack is a
    // 16-byte aligned static used for nothing else.
    unsafe { tiny_gate::init_cpu(cpu, rsp0_top) }.expect("CPU bring-up failed");

    // SAFETY: called once, with the bootloader's memory map and page tables.
    unsafe { memory::init(boot_info) };
    cpu
}

/// Mask both 8259s: the trampoline enables interrupts and nothing here
/// services external ones.
fn mask_legacy_pic() {
    // SAFETY: ring 0; writing the interrupt-mask registers has no other effect.
    unsafe {
        Port::<u8>::new(0x21).write(0xFF);
        Port::<u8>::new(0xA1).write(0xFF);
    }
}

/// Halt until the next interrupt, forever.
pub fn hlt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Test trait
pub trait Testable {
    /// テストを実行し、結果をデバッグ出力に書き込みます
    fn run(&self);
}

/// 型名から最後の識別子のみを抽出（テスト表示用）
fn short_type_name<T>() -> &'static str {
    core::any::type_name::<T>()
        .rsplit("::")
        .next()
        .unwrap_or("unknown")
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        debug_print!("[TEST] {} ... ", short_type_name::<T>());
        self();
        debug_println!("ok");
    }
}

/// Test runner
pub fn test_runner(tests: &[&dyn Testable]) {
    debug_println!("[TEST RUNNER] running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success);
}

/// テストパニックハンドラの実装
#[inline(never)]
pub fn test_panic_handler(info: &PanicInfo<'_>) -> ! {
    debug_println!("[TEST PANIC] {}", info);
    exit_qemu(QemuExitCode::Failed);
}
