//! User pages for ring-3 round trips.
//!
//! A bump frame allocator over the bootloader's memory map and an
//! `OffsetPageTable` over the physical-memory window are enough to place a
//! few user pages next to the kernel.

use bootloader_api::BootInfo;
use bootloader_api::info::{MemoryRegion, MemoryRegionKind};
use spin::{Mutex, Once};
use x86_64::VirtAddr;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::mapper::MapToError;
use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame,
    Size4KiB,
};

const PAGE_SIZE: usize = 4096;

/// Frame allocator that hands out usable frames in order and never frees.
pub struct BootInfoFrameAllocator {
    memory_map: &'static [MemoryRegion],
    next: usize,
}

impl BootInfoFrameAllocator {
    /// メモリマップからフレームアロケータを初期化
    ///
    /// # Safety
    ///
    /// Every `Usable` region in `memory_map` must really be unused, and this
    /// must be the only allocator over it.
    pub unsafe fn init(memory_map: &'static [MemoryRegion]) -> Self {
        Self {
            memory_map,
            next: 0,
        }
    }

    /// 利用可能なフレームのイテレータを返す
    fn usable_frames(&self) -> impl Iterator<Item = PhysFrame> + use<> {
        // Skip low memory (< 1MB): real-mode structures and legacy devices.
        const SAFE_MEMORY_START: u64 = 0x10_0000;

        let memory_map: &'static [MemoryRegion] = self.memory_map;
        memory_map
            .iter()
            .filter(|r| r.kind == MemoryRegionKind::Usable)
            .filter(|r| r.end > SAFE_MEMORY_START)
            .map(|r| r.start.max(SAFE_MEMORY_START)..r.end)
            .flat_map(|range| range.step_by(PAGE_SIZE))
            .map(|addr| PhysFrame::containing_address(x86_64::PhysAddr::new(addr)))
    }
}

// SAFETY: frames come from Usable regions only and are never handed out twice.
unsafe impl FrameAllocator<Size4KiB> for BootInfoFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let frame = self.usable_frames().nth(self.next);
        self.next += 1;
        frame
    }
}

/// Page tables and frames for mapping user pages.
pub struct UserMemory {
    mapper: OffsetPageTable<'static>,
    frames: BootInfoFrameAllocator,
    physical_memory_offset: VirtAddr,
}

static USER_MEMORY: Once<Mutex<UserMemory>> = Once::new();

/// Capture the bootloader's page tables and memory map.
///
/// # Safety
///
/// Call once, before anything else allocates frames or edits the active
/// page tables.
pub unsafe fn init(boot_info: &'static BootInfo) {
    let offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("BOOTLOADER_CONFIG requests a physical memory mapping");
    let physical_memory_offset = VirtAddr::new(offset);

    let (level_4_frame, _) = Cr3::read();
    let level_4: *mut PageTable =
        (physical_memory_offset + level_4_frame.start_address().as_u64()).as_mut_ptr();
    // SAFETY: the bootloader maps all physical memory at the offset, and the
    // caller guarantees nobody else holds a reference to the active tables.
    let mapper = unsafe { OffsetPageTable::new(&mut *level_4, physical_memory_offset) };
    // SAFETY: forwarded to the caller.
    let frames = unsafe { BootInfoFrameAllocator::init(&boot_info.memory_regions) };

    USER_MEMORY.call_once(|| {
        Mutex::new(UserMemory {
            mapper,
            frames,
            physical_memory_offset,
        })
    });
}

/// Map one user page at `addr` holding `contents` (zero-filled after it).
///
/// # Errors
///
/// `PageAlreadyMapped` if something already lives at `addr`, or
/// `FrameAllocationFailed` when memory runs out.
pub fn map_user_page(
    addr: VirtAddr,
    contents: &[u8],
    writable: bool,
) -> Result<(), MapToError<Size4KiB>> {
    assert!(contents.len() <= PAGE_SIZE, "user page contents exceed one page");
    let mut memory = USER_MEMORY
        .get()
        .expect("memory::init runs during boot")
        .lock();
    let memory = &mut *memory;

    let frame = memory
        .frames
        .allocate_frame()
        .ok_or(MapToError::FrameAllocationFailed)?;
    let dst: *mut u8 = (memory.physical_memory_offset + frame.start_address().as_u64()).as_mut_ptr();
    // SAFETY: a fresh frame, reachable through the physical-memory window.
    unsafe {
        core::ptr::write_bytes(dst, 0, PAGE_SIZE);
        core::ptr::copy_nonoverlapping(contents.as_ptr(), dst, contents.len());
    }

    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if writable {
        flags |= PageTableFlags::WRITABLE;
    }
    let parents =
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    let page = Page::<Size4KiB>::containing_address(addr);
    // SAFETY: the frame is unused and the page is in the user half, away
    // from anything the bootloader mapped.
    unsafe {
        memory
            .mapper
            .map_to_with_table_flags(page, frame, flags, parents, &mut memory.frames)?
            .flush();
    }
    Ok(())
}
