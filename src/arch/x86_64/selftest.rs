// src/arch/x86_64/selftest.rs
//! Kernel-origin transition self-test
//!
//! Issues `syscall` from ring 0 with the reserved self-test number. The
//! dispatcher answers it without involving the registered consumer, so the
//! test exercises only the trampoline: kernel-origin classification, the
//! frame on the caller's stack, active-frame publication and the `iretq`
//! return without `swapgs`.

use x86_64::instructions::segmentation::{CS, Segment};

use crate::config::SELF_TEST_SYSCALL;
use crate::errors::SelfTestError;
use crate::kernel::trap::{self, SelfTestRecord, self_test_answer};

use super::{gdt, per_cpu};

const ROUNDTRIP_ARG: u64 = 0x0123_4567_89AB_CDEF;

/// Round-trip one kernel-origin syscall and check what came back.
///
/// Must run after [`crate::init_cpu`] on the calling CPU, and must not
/// migrate to another CPU while it runs.
///
/// # Errors
///
/// The first mismatch found; see [`SelfTestError`].
pub fn kernel_origin_roundtrip() -> Result<(), SelfTestError> {
    if CS::get_reg().0 & 3 != 0 {
        return Err(SelfTestError::NotSupervisor);
    }
    // SAFETY: ring 0 after init_cpu, so GS is the kernel base.
    let block = unsafe { per_cpu::current() };
    let cpu = block.cpu_index().ok_or(SelfTestError::NotBound)?;
    trap::reset_self_test_record(cpu);

    let sentinels: [(&'static str, u64); 9] = [
        ("rsi", 0x5151_5151_0000_0002),
        ("rdx", 0xD0D0_D0D0_0000_0003),
        ("r10", 0x1010_1010_0000_0004),
        ("r8", 0x0808_0808_0000_0005),
        ("r9", 0x0909_0909_0000_0006),
        ("r12", 0x1212_1212_0000_0012),
        ("r13", 0x1313_1313_0000_0013),
        ("r14", 0x1414_1414_0000_0014),
        ("r15", 0x1515_1515_0000_0015),
    ];
    let mut after = [0u64; 9];
    let result: u64;
    let rdi_after: u64;

    // SAFETY: CPL 0 with the transition block and LSTAR programmed. The
    // frame is built below RSP, so no red zone is assumed (no `nostack`).
    unsafe {
        core::arch::asm!(
            "syscall",
            inlateout("rax") SELF_TEST_SYSCALL => result,
            inlateout("rdi") ROUNDTRIP_ARG => rdi_after,
            inlateout("rsi") sentinels[0].1 => after[0],
            inlateout("rdx") sentinels[1].1 => after[1],
            inlateout("r10") sentinels[2].1 => after[2],
            inlateout("r8") sentinels[3].1 => after[3],
            inlateout("r9") sentinels[4].1 => after[4],
            inlateout("r12") sentinels[5].1 => after[5],
            inlateout("r13") sentinels[6].1 => after[6],
            inlateout("r14") sentinels[7].1 => after[7],
            inlateout("r15") sentinels[8].1 => after[8],
            out("rcx") _,
            out("r11") _,
        );
    }

    let expected = self_test_answer(ROUNDTRIP_ARG);
    if result != expected {
        return Err(SelfTestError::ResultMismatch { expected, actual: result });
    }
    if rdi_after != ROUNDTRIP_ARG {
        return Err(SelfTestError::RegisterClobbered {
            register: "rdi",
            expected: ROUNDTRIP_ARG,
            actual: rdi_after,
        });
    }
    for ((register, expected), actual) in sentinels.into_iter().zip(after) {
        if actual != expected {
            return Err(SelfTestError::RegisterClobbered { register, expected, actual });
        }
    }

    check_record(trap::take_self_test_record(cpu))?;
    if block.active_frame().is_some() {
        return Err(SelfTestError::ActiveFrameLeaked);
    }

    log::info!("[SELFTEST] CPU {} kernel-origin syscall round trip ok", cpu);
    Ok(())
}

/// Check the frame the dispatcher saw for a kernel-origin trap.
pub(crate) fn check_record(record: Option<SelfTestRecord>) -> Result<(), SelfTestError> {
    let record = record.ok_or(SelfTestError::FrameNotPublished)?;
    if record.published == 0 || record.published != record.frame {
        return Err(SelfTestError::FrameNotPublished);
    }
    for (slot, value) in [
        ("rcx", record.rcx),
        ("r11", record.r11),
        ("error_code", record.error_code),
    ] {
        if value != 0 {
            return Err(SelfTestError::SlotNotZeroed { slot, value });
        }
    }
    if record.cs != u64::from(gdt::KERNEL_CODE) || record.ss != u64::from(gdt::KERNEL_DATA) {
        return Err(SelfTestError::WrongSelectors {
            cs: record.cs,
            ss: record.ss,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_record() -> SelfTestRecord {
        SelfTestRecord {
            frame: 0xFFFF_8000_0001_0F58,
            published: 0xFFFF_8000_0001_0F58,
            rcx: 0,
            r11: 0,
            error_code: 0,
            cs: u64::from(gdt::KERNEL_CODE),
            ss: u64::from(gdt::KERNEL_DATA),
        }
    }

    #[test]
    fn clean_record_passes() {
        assert_eq!(check_record(Some(good_record())), Ok(()));
    }

    #[test]
    fn missing_or_foreign_publication_fails() {
        assert_eq!(check_record(None), Err(SelfTestError::FrameNotPublished));
        let unpublished = SelfTestRecord { published: 0, ..good_record() };
        assert_eq!(check_record(Some(unpublished)), Err(SelfTestError::FrameNotPublished));
        let other = SelfTestRecord { published: 0xFFFF_8000_0002_0000, ..good_record() };
        assert_eq!(check_record(Some(other)), Err(SelfTestError::FrameNotPublished));
    }

    #[test]
    fn cpu_return_state_in_frame_fails() {
        // What a trampoline that pushed RCX/R11 instead of zero would leave.
        let leaked = SelfTestRecord {
            rcx: 0xFFFF_8000_0000_1234,
            r11: 0x202,
            ..good_record()
        };
        assert_eq!(
            check_record(Some(leaked)),
            Err(SelfTestError::SlotNotZeroed { slot: "rcx", value: 0xFFFF_8000_0000_1234 })
        );
        let flags_only = SelfTestRecord { r11: 0x202, ..good_record() };
        assert_eq!(
            check_record(Some(flags_only)),
            Err(SelfTestError::SlotNotZeroed { slot: "r11", value: 0x202 })
        );
        let error_code = SelfTestRecord { error_code: 1, ..good_record() };
        assert_eq!(
            check_record(Some(error_code)),
            Err(SelfTestError::SlotNotZeroed { slot: "error_code", value: 1 })
        );
    }

    #[test]
    fn user_selectors_fail() {
        let user = SelfTestRecord {
            cs: u64::from(gdt::USER_CODE),
            ss: u64::from(gdt::USER_DATA),
            ..good_record()
        };
        assert_eq!(
            check_record(Some(user)),
            Err(SelfTestError::WrongSelectors {
                cs: u64::from(gdt::USER_CODE),
                ss: u64::from(gdt::USER_DATA),
            })
        );
    }
}
