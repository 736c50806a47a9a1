// src/errors/unified.rs

//! Unified error types for the transition core

use core::fmt;

/// Top-level kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Per-CPU state error
    PerCpu(PerCpuError),
    /// Syscall mechanism setup error
    SyscallInit(SyscallInitError),
    /// Self-test failure
    SelfTest(SelfTestError),
    /// Logger installation error
    Logger(LoggerError),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::PerCpu(e) => write!(f, "per-CPU error: {}", e),
            KernelError::SyscallInit(e) => write!(f, "syscall init error: {}", e),
            KernelError::SelfTest(e) => write!(f, "self-test failed: {}", e),
            KernelError::Logger(e) => write!(f, "logger error: {}", e),
        }
    }
}

/// Per-CPU state errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerCpuError {
    /// CPU index beyond the static slot tables
    CpuIndexOutOfRange {
        /// Requested index
        index: usize,
        /// Number of slots
        max: usize,
    },
    /// The slot was already bound to a CPU
    AlreadyInitialized(usize),
    /// A built descriptor table does not match the selectors the trampoline pushes
    SelectorMismatch {
        /// Which selector
        selector: &'static str,
        /// Selector the trampoline uses
        expected: u16,
        /// Selector the table produced
        actual: u16,
    },
}

impl fmt::Display for PerCpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerCpuError::CpuIndexOutOfRange { index, max } => {
                write!(f, "CPU index {} out of range (max {})", index, max)
            }
            PerCpuError::AlreadyInitialized(index) => {
                write!(f, "CPU {} already initialized", index)
            }
            PerCpuError::SelectorMismatch { selector, expected, actual } => write!(
                f,
                "{} selector is {:#x}, trampoline pushes {:#x}",
                selector, actual, expected
            ),
        }
    }
}

impl From<PerCpuError> for KernelError {
    fn from(err: PerCpuError) -> Self {
        KernelError::PerCpu(err)
    }
}

/// Syscall mechanism setup errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallInitError {
    /// Selector layout cannot be expressed in STAR
    InvalidStarSelectors(&'static str),
    /// A trap consumer is already installed
    ConsumerAlreadyRegistered,
    /// The transition block for this CPU was not initialized first
    PerCpuNotReady,
}

impl fmt::Display for SyscallInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyscallInitError::InvalidStarSelectors(why) => {
                write!(f, "invalid STAR selectors: {}", why)
            }
            SyscallInitError::ConsumerAlreadyRegistered => {
                write!(f, "trap consumer already registered")
            }
            SyscallInitError::PerCpuNotReady => write!(f, "per-CPU block not ready"),
        }
    }
}

impl From<SyscallInitError> for KernelError {
    fn from(err: SyscallInitError) -> Self {
        KernelError::SyscallInit(err)
    }
}

/// Kernel-origin self-test failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfTestError {
    /// The result register did not carry the expected value
    ResultMismatch {
        /// Expected result
        expected: u64,
        /// Observed result
        actual: u64,
    },
    /// A register other than the result register changed across the call
    RegisterClobbered {
        /// Register name
        register: &'static str,
        /// Value before the call
        expected: u64,
        /// Value after the call
        actual: u64,
    },
    /// The dispatcher did not see its own frame published
    FrameNotPublished,
    /// A frame slot that must be recorded as zero was not
    SlotNotZeroed {
        /// Frame slot name
        slot: &'static str,
        /// Recorded value
        value: u64,
    },
    /// The frame carried selectors other than the kernel pair
    WrongSelectors {
        /// Recorded CS
        cs: u64,
        /// Recorded SS
        ss: u64,
    },
    /// The calling CPU has no bound transition block
    NotBound,
    /// The active-frame field was still set after return
    ActiveFrameLeaked,
    /// Not running at CPL 0
    NotSupervisor,
}

impl fmt::Display for SelfTestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelfTestError::ResultMismatch { expected, actual } => {
                write!(f, "result {:#x}, expected {:#x}", actual, expected)
            }
            SelfTestError::RegisterClobbered { register, expected, actual } => write!(
                f,
                "{} changed from {:#x} to {:#x}",
                register, expected, actual
            ),
            SelfTestError::FrameNotPublished => write!(f, "frame not published during dispatch"),
            SelfTestError::SlotNotZeroed { slot, value } => {
                write!(f, "frame slot {} recorded {:#x}, expected 0", slot, value)
            }
            SelfTestError::WrongSelectors { cs, ss } => {
                write!(f, "frame selectors cs={:#x} ss={:#x}", cs, ss)
            }
            SelfTestError::NotBound => write!(f, "transition block not bound on this CPU"),
            SelfTestError::ActiveFrameLeaked => write!(f, "active frame still set after return"),
            SelfTestError::NotSupervisor => write!(f, "not running in ring 0"),
        }
    }
}

impl From<SelfTestError> for KernelError {
    fn from(err: SelfTestError) -> Self {
        KernelError::SelfTest(err)
    }
}

/// Logger installation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerError {
    /// `log` already has a global logger
    AlreadyInstalled,
}

impl fmt::Display for LoggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoggerError::AlreadyInstalled => write!(f, "logger already installed"),
        }
    }
}

impl From<LoggerError> for KernelError {
    fn from(err: LoggerError) -> Self {
        KernelError::Logger(err)
    }
}

/// Result type using the unified kernel error
pub type Result<T> = core::result::Result<T, KernelError>;
