// src/lib.rs
//! Tiny Gate - x86_64 特権遷移コア
//!
//! `syscall` 命令から入ってくる遷移を、ハードウェア例外と同じ形の
//! [`TrapFrame`](arch::x86_64::TrapFrame) に変換し、登録された
//! [`TrapConsumer`](kernel::trap::TrapConsumer) に渡して `iretq` で戻ります。
//!
//! # Bring-up order (per CPU)
//!
//! 1. [`kernel::driver::serial::init`] / [`kernel::logger::init`] (optional)
//! 2. [`init_cpu`]
//! 3. [`kernel::trap::register_consumer`] (once, any CPU)
//! 4. [`arch::x86_64::selftest::kernel_origin_roundtrip`] (optional)

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

#[cfg(not(target_arch = "x86_64"))]
compile_error!("tiny_gate only supports x86_64");

pub mod arch;
pub mod config;
pub mod errors;
pub mod kernel;

use x86_64::VirtAddr;

use crate::arch::x86_64::{TransitionBlock, gdt, per_cpu, syscall, tss};

/// `debug_print!` マクロ - デバッグ専用（シリアルポートのみ）
///
/// シリアルが初期化されるまでは何も出力しません。
#[macro_export]
macro_rules! debug_print {
    ($($arg:tt)*) => {{
        $crate::kernel::driver::write_debug(format_args!($($arg)*));
    }};
}

/// `debug_println!` マクロ - デバッグ専用（改行付き）
#[macro_export]
macro_rules! debug_println {
    () => ($crate::debug_print!("\n"));
    ($($arg:tt)*) => ($crate::debug_print!("{}\n", format_args!($($arg)*)));
}

/// CPU を遷移可能な状態にする
///
/// RSP0 を設定し、遷移ブロックを GS ベースに結び付け、GDT/TSS をロードし、
/// SYSCALL 用 MSR を書き込みます。
///
/// # Safety
///
/// - Ring 0 で、`cpu` 自身の上で一度だけ呼び出すこと
/// - `kernel_stack_top` は 16 バイト境界の有効なカーネルスタックの末尾であること
///
/// # Errors
///
/// 各段階のエラーを [`errors::KernelError`] として返します。
pub unsafe fn init_cpu(
    cpu: usize,
    kernel_stack_top: VirtAddr,
) -> errors::Result<&'static TransitionBlock> {
    // SAFETY: forwarded to the caller.
    unsafe { tss::set_privilege_stack(cpu, kernel_stack_top)? };
    let block = per_cpu::init(cpu)?;
    gdt::load(cpu)?;
    syscall::init(cpu)?;
    log::info!("[OK] CPU {} ready for privilege transitions", cpu);
    Ok(block)
}
