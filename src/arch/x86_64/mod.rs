// src/arch/x86_64/mod.rs

//! x86_64 privilege transitions
//!
//! - [`gdt`], [`tss`]: fixed selector layout and the per-CPU RSP0 source
//! - [`per_cpu`]: the GS-addressed transition block
//! - [`trap_frame`]: the frame every trap is described by
//! - [`syscall`]: MSR setup, the entry trampoline and the shared return path
//! - [`selftest`]: ring-0 round trip through the trampoline

pub mod gdt;
pub mod per_cpu;
pub mod selftest;
pub mod syscall;
pub mod trap_frame;
pub mod tss;

pub use per_cpu::TransitionBlock;
pub use trap_frame::{Origin, TrapFrame};
