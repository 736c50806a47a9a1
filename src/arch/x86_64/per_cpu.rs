// src/arch/x86_64/per_cpu.rs
//! Per-CPU Transition Block
//!
//! Each logical CPU owns one [`TransitionBlock`], reachable through the GS
//! base while the CPU runs kernel code. The syscall trampoline touches it
//! with `gs:`-relative moves only, before any stack is known to be valid.
//!
//! # GS base discipline
//!
//! ```text
//! Kernel mode: IA32_GS_BASE        -> TransitionBlock of this CPU
//!              IA32_KERNEL_GS_BASE -> user GS base
//! User mode:   the two are exchanged by `swapgs`
//! ```
//!
//! Only user-origin transitions execute `swapgs`; a syscall issued from
//! ring 0 already has the kernel GS base loaded.
//!
//! # Memory Layout
//!
//! ```text
//! Offset 0x00: tss_ptr        - this CPU's TSS (RSP0 source)
//! Offset 0x08: scratch_rsp    - caller RSP, valid only inside the prologue
//! Offset 0x10: scratch_r14    - caller R14, valid only inside the prologue
//! Offset 0x18: active_frame   - frame being handled, or null
//! Offset 0x20: this           - address of this block
//! Offset 0x28: cpu_index      - dense slot index (not the APIC ID)
//! ```

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use x86_64::VirtAddr;
use x86_64::registers::model_specific::Msr;
use x86_64::structures::tss::TaskStateSegment;

use crate::config::MAX_CPUS;
use crate::errors::PerCpuError;

use super::trap_frame::TrapFrame;
use super::tss;

/// MSR addresses for GS base management
const IA32_GS_BASE: u32 = 0xC000_0101;
const IA32_KERNEL_GS_BASE: u32 = 0xC000_0102;

/// Marker stored in `cpu_index` before a block is bound.
const UNBOUND: usize = usize::MAX;

/// Per-CPU transition block.
///
/// The offsets in [`offset`] MUST match this struct's layout; the
/// syscall trampoline uses them as immediates.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct TransitionBlock {
    tss: AtomicPtr<TaskStateSegment>,
    scratch_rsp: AtomicU64,
    scratch_r14: AtomicU64,
    active_frame: AtomicPtr<TrapFrame>,
    this: AtomicPtr<TransitionBlock>,
    cpu_index: AtomicUsize,
    _reserved: [u64; 2],
}

/// Offsets into [`TransitionBlock`]
pub mod offset {
    /// `tss` field
    pub const TSS_PTR: usize = 0x00;
    /// `scratch_rsp` field
    pub const SCRATCH_RSP: usize = 0x08;
    /// `scratch_r14` field
    pub const SCRATCH_R14: usize = 0x10;
    /// `active_frame` field
    pub const ACTIVE_FRAME: usize = 0x18;
    /// `this` field
    pub const THIS: usize = 0x20;
    /// `cpu_index` field
    pub const CPU_INDEX: usize = 0x28;
}

// Compile-time layout verification
const _: () = {
    use core::mem::{offset_of, size_of};

    assert!(offset_of!(TransitionBlock, tss) == offset::TSS_PTR);
    assert!(offset_of!(TransitionBlock, scratch_rsp) == offset::SCRATCH_RSP);
    assert!(offset_of!(TransitionBlock, scratch_r14) == offset::SCRATCH_R14);
    assert!(offset_of!(TransitionBlock, active_frame) == offset::ACTIVE_FRAME);
    assert!(offset_of!(TransitionBlock, this) == offset::THIS);
    assert!(offset_of!(TransitionBlock, cpu_index) == offset::CPU_INDEX);
    assert!(size_of::<TransitionBlock>() == 64);
};

impl TransitionBlock {
    /// An unbound block.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tss: AtomicPtr::new(ptr::null_mut()),
            scratch_rsp: AtomicU64::new(0),
            scratch_r14: AtomicU64::new(0),
            active_frame: AtomicPtr::new(ptr::null_mut()),
            this: AtomicPtr::new(ptr::null_mut()),
            cpu_index: AtomicUsize::new(UNBOUND),
            _reserved: [0; 2],
        }
    }

    /// Bind this block to `cpu` and its TSS.
    ///
    /// # Errors
    ///
    /// `AlreadyInitialized` if the block was bound before.
    pub fn bind(&self, cpu: usize, tss: *mut TaskStateSegment) -> Result<(), PerCpuError> {
        self.cpu_index
            .compare_exchange(UNBOUND, cpu, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| PerCpuError::AlreadyInitialized(cpu))?;
        self.tss.store(tss, Ordering::Release);
        self.this
            .store(ptr::from_ref(self).cast_mut(), Ordering::Release);
        Ok(())
    }

    /// Slot index, if bound.
    #[must_use]
    pub fn cpu_index(&self) -> Option<usize> {
        match self.cpu_index.load(Ordering::Acquire) {
            UNBOUND => None,
            index => Some(index),
        }
    }

    /// The TSS this block recovers RSP0 from.
    #[must_use]
    pub fn tss(&self) -> Option<NonNull<TaskStateSegment>> {
        NonNull::new(self.tss.load(Ordering::Acquire))
    }

    /// RSP0 as the trampoline sees it: `[tss_ptr + RSP0_OFFSET]`.
    #[must_use]
    pub fn privilege_stack(&self) -> Option<VirtAddr> {
        self.tss().map(|tss| {
            // SAFETY: a bound TSS pointer refers to a static slot.
            unsafe {
                tss.as_ptr()
                    .cast::<u8>()
                    .add(tss::RSP0_OFFSET)
                    .cast::<VirtAddr>()
                    .read_unaligned()
            }
        })
    }

    /// Caller RSP saved by the current prologue.
    #[must_use]
    pub fn scratch_rsp(&self) -> u64 {
        self.scratch_rsp.load(Ordering::Relaxed)
    }

    /// Caller R14 saved by the current prologue.
    #[must_use]
    pub fn scratch_r14(&self) -> u64 {
        self.scratch_r14.load(Ordering::Relaxed)
    }

    /// Publish the frame being handled. Single aligned store.
    pub fn publish_frame(&self, frame: NonNull<TrapFrame>) {
        self.active_frame.store(frame.as_ptr(), Ordering::Release);
    }

    /// Mark that no trap is in progress.
    pub fn clear_frame(&self) {
        self.active_frame.store(ptr::null_mut(), Ordering::Release);
    }

    /// The frame currently being handled on this CPU, if any.
    #[must_use]
    pub fn active_frame(&self) -> Option<NonNull<TrapFrame>> {
        NonNull::new(self.active_frame.load(Ordering::Acquire))
    }

    /// Detach the in-progress frame pointer before switching threads.
    pub fn take_active_frame(&self) -> *mut TrapFrame {
        self.active_frame.swap(ptr::null_mut(), Ordering::AcqRel)
    }

    /// Reinstall a frame pointer saved by [`take_active_frame`](Self::take_active_frame).
    pub fn restore_active_frame(&self, frame: *mut TrapFrame) {
        self.active_frame.store(frame, Ordering::Release);
    }
}

impl Default for TransitionBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Static per-CPU block array
static BLOCKS: [TransitionBlock; MAX_CPUS] = [const { TransitionBlock::new() }; MAX_CPUS];

/// Block for a specific CPU slot.
///
/// # Errors
///
/// Fails if `cpu` is not a valid slot.
pub fn get(cpu: usize) -> Result<&'static TransitionBlock, PerCpuError> {
    BLOCKS.get(cpu).ok_or(PerCpuError::CpuIndexOutOfRange {
        index: cpu,
        max: MAX_CPUS,
    })
}

/// Block of the calling CPU, through the GS base.
///
/// # Safety
///
/// [`init`] must have run on this CPU and the CPU must be in kernel mode
/// with the kernel GS base loaded.
#[inline(always)]
pub unsafe fn current() -> &'static TransitionBlock {
    let this: *const TransitionBlock;
    // SAFETY: caller guarantees GS points at an initialized block.
    unsafe {
        core::arch::asm!(
            "mov {}, gs:[{this}]",
            out(reg) this,
            this = const offset::THIS,
            options(nostack, preserves_flags, readonly),
        );
        &*this
    }
}

/// Marker for a slot no CPU has claimed.
const NO_OWNER: u32 = u32::MAX;

/// APIC ID owning each slot.
static SLOT_OWNERS: [AtomicU32; MAX_CPUS] = [const { AtomicU32::new(NO_OWNER) }; MAX_CPUS];

/// Initial local APIC ID of the calling CPU (CPUID leaf 1).
///
/// This is a hardware ID, not a slot index: IDs may be sparse and can
/// exceed `MAX_CPUS`. Use [`claim_current_slot`] for a dense index.
#[must_use]
pub fn initial_apic_id() -> u8 {
    raw_cpuid::CpuId::new()
        .get_feature_info()
        .map_or(0, |info| info.initial_local_apic_id())
}

/// Dense slot index for the calling CPU.
///
/// The first call on a CPU claims the lowest free slot for its APIC ID;
/// later calls on the same CPU return that slot again.
///
/// # Errors
///
/// `CpuIndexOutOfRange` (with the APIC ID as `index`) once every slot is
/// owned by another CPU.
pub fn claim_current_slot() -> Result<usize, PerCpuError> {
    claim_slot(&SLOT_OWNERS, u32::from(initial_apic_id()))
}

fn claim_slot(owners: &[AtomicU32], apic_id: u32) -> Result<usize, PerCpuError> {
    // Slots fill from the bottom, so an owned slot is always found before
    // the first free one.
    for (slot, owner) in owners.iter().enumerate() {
        match owner.compare_exchange(NO_OWNER, apic_id, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Ok(slot),
            Err(current) if current == apic_id => return Ok(slot),
            Err(_) => {}
        }
    }
    Err(PerCpuError::CpuIndexOutOfRange {
        index: apic_id as usize,
        max: owners.len(),
    })
}

/// Initialize the transition block for `cpu` on the calling CPU.
///
/// Binds the block to the CPU's TSS and points the GS base at it. Must run
/// before the CPU can execute `syscall`.
///
/// # Errors
///
/// Fails for an out-of-range slot or a slot that is already bound.
pub fn init(cpu: usize) -> Result<&'static TransitionBlock, PerCpuError> {
    let block = get(cpu)?;
    block.bind(cpu, tss::as_ptr(cpu)?)?;

    let block_addr = ptr::from_ref(block) as u64;
    // SAFETY: ring 0; the block is static and bound, so every later
    // `gs:`-relative access lands in it. User GS starts at 0.
    unsafe {
        Msr::new(IA32_GS_BASE).write(block_addr);
        Msr::new(IA32_KERNEL_GS_BASE).write(0);
    }

    log::info!("[Per-CPU] CPU {} transition block at {:#x}", cpu, block_addr);
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_fits_one_cache_line() {
        assert_eq!(core::mem::align_of::<TransitionBlock>(), 64);
        assert_eq!(core::mem::size_of::<TransitionBlock>(), 64);
    }

    #[test]
    fn bind_once() {
        let block = TransitionBlock::new();
        let mut tss = TaskStateSegment::new();
        assert_eq!(block.cpu_index(), None);
        block.bind(3, &mut tss).unwrap();
        assert_eq!(block.cpu_index(), Some(3));
        assert_eq!(block.bind(3, &mut tss), Err(PerCpuError::AlreadyInitialized(3)));
    }

    #[test]
    fn privilege_stack_follows_tss() {
        let block = TransitionBlock::new();
        let mut tss = TaskStateSegment::new();
        tss.privilege_stack_table[0] = VirtAddr::new(0xFFFF_8000_0010_0000);
        assert_eq!(block.privilege_stack(), None);
        block.bind(0, &mut tss).unwrap();
        assert_eq!(block.privilege_stack(), Some(VirtAddr::new(0xFFFF_8000_0010_0000)));

        tss.privilege_stack_table[0] = VirtAddr::new(0xFFFF_8000_0020_0000);
        assert_eq!(block.privilege_stack(), Some(VirtAddr::new(0xFFFF_8000_0020_0000)));
    }

    #[test]
    fn active_frame_bracket() {
        let block = TransitionBlock::new();
        let mut frame = TrapFrame::zeroed();
        assert!(block.active_frame().is_none());

        block.publish_frame(NonNull::from(&mut frame));
        assert_eq!(block.active_frame().map(NonNull::as_ptr), Some(ptr::from_mut(&mut frame)));

        block.clear_frame();
        assert!(block.active_frame().is_none());
    }

    #[test]
    fn active_frame_survives_context_switch() {
        let block = TransitionBlock::new();
        let mut frame = TrapFrame::zeroed();
        block.publish_frame(NonNull::from(&mut frame));

        let saved = block.take_active_frame();
        assert!(block.active_frame().is_none());

        block.restore_active_frame(saved);
        assert_eq!(block.active_frame().map(NonNull::as_ptr), Some(saved));
    }

    #[test]
    fn sparse_apic_ids_get_dense_slots() {
        let owners = [const { AtomicU32::new(NO_OWNER) }; 3];
        assert_eq!(claim_slot(&owners, 0), Ok(0));
        assert_eq!(claim_slot(&owners, 6), Ok(1));
        assert_eq!(claim_slot(&owners, 0), Ok(0));
        assert_eq!(claim_slot(&owners, 6), Ok(1));
        assert_eq!(claim_slot(&owners, 254), Ok(2));
        assert_eq!(
            claim_slot(&owners, 9),
            Err(PerCpuError::CpuIndexOutOfRange { index: 9, max: 3 })
        );
    }

    #[test]
    fn calling_cpu_id_claims_a_slot() {
        // CPUID is unprivileged, so this runs on the test host as well.
        let owners = [const { AtomicU32::new(NO_OWNER) }; 2];
        let id = u32::from(initial_apic_id());
        assert_eq!(claim_slot(&owners, id), Ok(0));
        assert_eq!(owners[0].load(Ordering::Acquire), id);
    }

    #[test]
    fn static_slots() {
        assert!(get(0).is_ok());
        assert!(matches!(
            get(MAX_CPUS),
            Err(PerCpuError::CpuIndexOutOfRange { .. })
        ));
    }
}
