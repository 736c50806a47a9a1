// src/kernel/trap.rs
//! Trap consumer seam
//!
//! The trampoline calls [`dispatch_syscall_trap`] with the frame it built and
//! the first syscall argument read back out of that frame. Everything past
//! this point (the syscall table, the scheduler, user-copy helpers) belongs
//! to the [`TrapConsumer`] the kernel registers.

use core::ptr::NonNull;

use spin::{Mutex, Once};

use crate::arch::x86_64::per_cpu::{self, TransitionBlock};
use crate::arch::x86_64::trap_frame::{Origin, TrapFrame};
use crate::config::{MAX_CPUS, SELF_TEST_SYSCALL, SYSCALL_TRACE};
use crate::errors::SyscallInitError;

/// `ENOSYS`: returned when no consumer is registered.
pub const ENOSYS: i64 = 38;

/// Kernel-side handler for syscall-originated traps.
///
/// The consumer must read arguments from the frame, never from live
/// registers, and reports its result through [`TrapFrame::set_result`]
/// (negative values are errno codes). Anything it writes into the frame is
/// what the caller resumes with.
pub trait TrapConsumer: Sync {
    /// Service one syscall.
    fn handle_syscall(&self, frame: &mut TrapFrame, first_arg: u64);
}

impl<F> TrapConsumer for F
where
    F: Fn(&mut TrapFrame, u64) + Sync,
{
    fn handle_syscall(&self, frame: &mut TrapFrame, first_arg: u64) {
        self(frame, first_arg);
    }
}

static CONSUMER: Once<&'static dyn TrapConsumer> = Once::new();

/// Install the kernel's trap consumer. Only the first call wins.
///
/// # Errors
///
/// `ConsumerAlreadyRegistered` on every call after the first.
pub fn register_consumer(consumer: &'static dyn TrapConsumer) -> Result<(), SyscallInitError> {
    let mut installed = false;
    CONSUMER.call_once(|| {
        installed = true;
        consumer
    });
    if installed {
        log::info!("[TRAP] consumer registered");
        Ok(())
    } else {
        Err(SyscallInitError::ConsumerAlreadyRegistered)
    }
}

/// What the dispatcher saw while answering one self-test trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfTestRecord {
    /// Address of the frame handed to the dispatcher
    pub frame: u64,
    /// Active-frame field of the transition block at that moment
    pub published: u64,
    /// Frame's RCX slot
    pub rcx: u64,
    /// Frame's R11 slot
    pub r11: u64,
    /// Frame's error code
    pub error_code: u64,
    /// Frame's CS
    pub cs: u64,
    /// Frame's SS
    pub ss: u64,
}

impl SelfTestRecord {
    fn capture(frame: &TrapFrame, published: *mut TrapFrame) -> Self {
        Self {
            frame: core::ptr::from_ref(frame) as u64,
            published: published as u64,
            rcx: frame.gprs.rcx,
            r11: frame.gprs.r11,
            error_code: frame.error_code,
            cs: frame.iret.cs,
            ss: frame.iret.ss,
        }
    }
}

/// One record slot per CPU; a self-test only ever touches its own.
static SELF_TEST_RECORDS: [Mutex<Option<SelfTestRecord>>; MAX_CPUS] =
    [const { Mutex::new(None) }; MAX_CPUS];

/// Forget whatever `cpu`'s last self-test trap recorded.
pub(crate) fn reset_self_test_record(cpu: usize) {
    if let Some(slot) = SELF_TEST_RECORDS.get(cpu) {
        *slot.lock() = None;
    }
}

/// Take the record `cpu`'s last self-test trap left.
pub(crate) fn take_self_test_record(cpu: usize) -> Option<SelfTestRecord> {
    SELF_TEST_RECORDS.get(cpu).and_then(|slot| slot.lock().take())
}

/// Called by the trampoline with interrupts enabled and the frame published.
pub(crate) extern "C" fn dispatch_syscall_trap(frame: &mut TrapFrame, first_arg: u64) {
    // SAFETY: the trampoline only runs after per_cpu::init on this CPU.
    let block = unsafe { per_cpu::current() };
    dispatch(CONSUMER.get().copied(), frame, first_arg, block);
}

/// Route one syscall frame taken on the CPU that owns `block`.
pub(crate) fn dispatch(
    consumer: Option<&dyn TrapConsumer>,
    frame: &mut TrapFrame,
    first_arg: u64,
    block: &TransitionBlock,
) {
    let number = frame.syscall_number();
    if SYSCALL_TRACE {
        log::trace!(
            "[SYSCALL-ENTRY] num={:#x} origin={:?} args={:x?}",
            number,
            frame.origin(),
            frame.syscall_args()
        );
    }

    if number == SELF_TEST_SYSCALL && frame.origin() == Origin::Kernel {
        let published = block
            .active_frame()
            .map_or(core::ptr::null_mut(), NonNull::as_ptr);
        let record = SelfTestRecord::capture(frame, published);
        if let Some(slot) = block.cpu_index().and_then(|cpu| SELF_TEST_RECORDS.get(cpu)) {
            *slot.lock() = Some(record);
        }
        frame.set_result(self_test_answer(first_arg) as i64);
    } else if let Some(consumer) = consumer {
        consumer.handle_syscall(frame, first_arg);
    } else {
        log::warn!("[TRAP] syscall {:#x} with no consumer registered", number);
        frame.set_result(-ENOSYS);
    }

    if SYSCALL_TRACE {
        log::trace!("[SYSCALL-RESULT] num={:#x} returned {}", number, frame.result());
    }
}

/// Value the dispatcher answers a kernel-origin self-test trap with.
#[must_use]
pub const fn self_test_answer(first_arg: u64) -> u64 {
    first_arg.rotate_left(17) ^ 0x5A5A_5A5A_5A5A_5A5A
}

/// Log the frame this CPU is handling, if any (fault and panic reporting).
///
/// # Safety
///
/// The CPU's transition block must be initialized and GS must hold the
/// kernel base.
pub unsafe fn report_active_frame() {
    // SAFETY: forwarded to the caller.
    let block = unsafe { per_cpu::current() };
    match block.active_frame() {
        // SAFETY: a published frame stays valid until the trampoline's
        // return half clears it, which cannot happen while we run on it.
        Some(frame) => log::error!("[TRAP] active frame:\n{:?}", unsafe { frame.as_ref() }),
        None => log::error!("[TRAP] no trap in progress"),
    }
}
