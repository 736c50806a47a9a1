// src/errors/mod.rs

//! Unified error handling module
//!
//! The transition path itself has no error path; these types cover per-CPU
//! bring-up, syscall MSR programming, logger installation and the
//! kernel-origin self-test.

pub mod unified;

pub use unified::{
    KernelError, LoggerError, PerCpuError, Result, SelfTestError, SyscallInitError,
};
