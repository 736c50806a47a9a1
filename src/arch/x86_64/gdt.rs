// src/arch/x86_64/gdt.rs
//! Global Descriptor Table (GDT)
//!
//! CPU ごとの GDT と TSS ディスクリプタを設定します。
//! セレクタの並びは SYSCALL/SYSRET の要件に従って固定されており、
//! トランポリンはここで定義した定数をそのままフレームに書き込みます。
//!
//! ```text
//!   0x08: kernel_code (Ring 0) - SYSCALL CS
//!   0x10: kernel_data (Ring 0) - SYSCALL SS (= kernel_code + 8)
//!   0x18: user_data   (Ring 3) - SYSRET SS  (= STAR[63:48] + 8)
//!   0x20: user_code   (Ring 3) - SYSRET CS  (= STAR[63:48] + 16)
//!   0x28: TSS (16 bytes)
//! ```

use spin::Once;
use x86_64::instructions::segmentation::{CS, DS, ES, SS, Segment};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};

use crate::config::MAX_CPUS;
use crate::errors::PerCpuError;

use super::tss;

/// カーネルコードセグメント（Ring 0）
pub const KERNEL_CODE: u16 = 0x08;
/// カーネルデータセグメント（Ring 0）
pub const KERNEL_DATA: u16 = 0x10;
/// ユーザーデータセグメント（Ring 3, RPL=3）
pub const USER_DATA: u16 = 0x18 | 3;
/// ユーザーコードセグメント（Ring 3, RPL=3）
pub const USER_CODE: u16 = 0x20 | 3;
/// TSS セグメント
pub const TSS: u16 = 0x28;

/// GDT とセグメントセレクタ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selectors {
    /// カーネルコードセグメント（Ring 0）
    pub kernel_code: SegmentSelector,
    /// カーネルデータセグメント（Ring 0）
    pub kernel_data: SegmentSelector,
    /// ユーザーコードセグメント（Ring 3）
    pub user_code: SegmentSelector,
    /// ユーザーデータセグメント（Ring 3）
    pub user_data: SegmentSelector,
    /// TSSセグメント
    pub tss: SegmentSelector,
}

impl Selectors {
    /// The fixed layout every CPU's table is built to.
    pub const FIXED: Self = Self {
        kernel_code: SegmentSelector(KERNEL_CODE),
        kernel_data: SegmentSelector(KERNEL_DATA),
        user_code: SegmentSelector(USER_CODE),
        user_data: SegmentSelector(USER_DATA),
        tss: SegmentSelector(TSS),
    };
}

/// STAR MSR value for the fixed layout.
///
/// Bits [47:32] hold the SYSCALL CS (SS is CS + 8). Bits [63:48] hold the
/// SYSRET base: SYSRET loads SS = base + 8 and CS = base + 16, both with RPL 3.
#[must_use]
pub const fn star_value() -> u64 {
    let sysret_base = (USER_CODE & !3) - 16;
    ((sysret_base as u64) << 48) | ((KERNEL_CODE as u64) << 32)
}

/// Check the layout against the SYSCALL/SYSRET selector arithmetic.
///
/// # Errors
///
/// Returns a description of the first violated rule.
pub const fn validate_star_layout() -> Result<(), &'static str> {
    if KERNEL_DATA != KERNEL_CODE + 8 {
        return Err("kernel_data must be kernel_code + 8");
    }
    if (USER_CODE & !3) != (USER_DATA & !3) + 8 {
        return Err("user_code must be user_data + 8");
    }
    if USER_CODE & 3 != 3 || USER_DATA & 3 != 3 {
        return Err("user selectors must carry RPL 3");
    }
    if KERNEL_CODE & 3 != 0 || KERNEL_DATA & 3 != 0 {
        return Err("kernel selectors must carry RPL 0");
    }
    Ok(())
}

const _: () = assert!(validate_star_layout().is_ok());

/// One CPU's descriptor table.
pub struct CpuTables {
    gdt: GlobalDescriptorTable,
    selectors: Selectors,
}

impl CpuTables {
    /// Selectors appended to this table.
    #[must_use]
    pub fn selectors(&self) -> &Selectors {
        &self.selectors
    }
}

impl core::fmt::Debug for CpuTables {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CpuTables")
            .field("selectors", &self.selectors)
            .finish_non_exhaustive()
    }
}

static TABLES: [Once<CpuTables>; MAX_CPUS] = [const { Once::new() }; MAX_CPUS];

fn build(cpu: usize) -> Result<CpuTables, PerCpuError> {
    let tss = tss::get(cpu)?;
    let mut gdt = GlobalDescriptorTable::new();

    let kernel_code = gdt.append(Descriptor::kernel_code_segment());
    let kernel_data = gdt.append(Descriptor::kernel_data_segment());
    let user_data = gdt.append(Descriptor::user_data_segment());
    let user_code = gdt.append(Descriptor::user_code_segment());
    let tss = gdt.append(Descriptor::tss_segment(tss));

    let selectors = Selectors {
        kernel_code,
        kernel_data,
        user_code,
        user_data,
        tss,
    };
    check_fixed(&selectors)?;

    Ok(CpuTables { gdt, selectors })
}

/// トランポリンが push する定数と一致するか確認
fn check_fixed(selectors: &Selectors) -> Result<(), PerCpuError> {
    let pairs = [
        ("kernel_code", selectors.kernel_code, KERNEL_CODE),
        ("kernel_data", selectors.kernel_data, KERNEL_DATA),
        ("user_code", selectors.user_code, USER_CODE),
        ("user_data", selectors.user_data, USER_DATA),
        ("tss", selectors.tss, TSS),
    ];
    for (selector, actual, expected) in pairs {
        if actual.0 != expected {
            return Err(PerCpuError::SelectorMismatch {
                selector,
                expected,
                actual: actual.0,
            });
        }
    }
    Ok(())
}

/// Get (building on first use) the descriptor table for `cpu`.
///
/// # Errors
///
/// Fails if `cpu` is not a valid slot, or with `SelectorMismatch` if the
/// built table disagrees with the selector constants.
pub fn tables(cpu: usize) -> Result<&'static CpuTables, PerCpuError> {
    let slot = TABLES.get(cpu).ok_or(PerCpuError::CpuIndexOutOfRange {
        index: cpu,
        max: MAX_CPUS,
    })?;
    if let Some(tables) = slot.get() {
        return Ok(tables);
    }
    let built = build(cpu)?;
    Ok(slot.call_once(|| built))
}

/// GDT を初期化
///
/// Loads `cpu`'s table, reloads CS/SS/DS/ES and the task register.
/// GS is left alone: its base is the transition block.
///
/// # Errors
///
/// Fails if `cpu` is not a valid slot.
pub fn load(cpu: usize) -> Result<(), PerCpuError> {
    let tables = tables(cpu)?;
    tables.gdt.load();

    // SAFETY: the selectors come from the table just loaded and describe
    // valid ring-0 segments and an available TSS.
    unsafe {
        CS::set_reg(tables.selectors.kernel_code);
        SS::set_reg(tables.selectors.kernel_data);
        DS::set_reg(SegmentSelector(0));
        ES::set_reg(SegmentSelector(0));
        load_tss(tables.selectors.tss);
    }

    log::debug!(
        "[GDT] CPU {} loaded: kcs={:#x} kss={:#x} ucs={:#x} uss={:#x} tss={:#x}",
        cpu,
        tables.selectors.kernel_code.0,
        tables.selectors.kernel_data.0,
        tables.selectors.user_code.0,
        tables.selectors.user_data.0,
        tables.selectors.tss.0
    );
    Ok(())
}
