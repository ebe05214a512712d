//! UEFI boot handoff
//!
//! The loader leaves one structure behind: the memory map, framebuffer
//! geometry, program header addresses, kernel entry and command line. The
//! frame allocator is seeded from the map; reserved ranges survive as-is so
//! firmware tables and MMIO stay addressable.

use alloc::string::String;

use crate::error::{KernelError, KernelResult};
use crate::mm::frame_allocator::{FrameAllocator, FrameAttributes, FrameType};
use crate::mm::{PhysicalAddress, FRAME_SIZE};
use crate::sync::GlobalState;

/// Memory map entry types as the loader reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryMapEntryType {
    Usable = 1,
    Reserved = 2,
    AcpiReclaim = 3,
    AcpiCode = 4,
    AcpiData = 5,
    Mmio = 6,
}

/// One memory map row: `(type, base, frame count, attributes)`.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapEntry {
    pub entry_type: MemoryMapEntryType,
    pub base: u64,
    pub frame_count: u64,
    pub attributes: u64,
}

/// Framebuffer geometry.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramebufferInfo {
    pub base: u64,
    pub width: u32,
    pub height: u32,
    pub pixels_per_scanline: u32,
}

/// Program header relocation info for the kernel image.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgramInfo {
    pub virtual_base: u64,
    pub physical_base: u64,
    pub got_base: u64,
    pub entry: u64,
}

/// Everything the loader hands over.
pub struct BootHandoff<'a> {
    pub memory_map: &'a [MemoryMapEntry],
    pub framebuffer: FramebufferInfo,
    pub program: ProgramInfo,
    pub command_line: &'a str,
}

/// The parts of the handoff the kernel keeps after boot (the memory map is
/// consumed by the frame allocator and not retained).
pub struct BootInfo {
    pub framebuffer: FramebufferInfo,
    pub program: ProgramInfo,
    pub command_line: String,
}

/// Boot information singleton; installed once during `_start`.
pub static BOOT_INFO: GlobalState<BootInfo> = GlobalState::new();

/// Persist the loader handoff for the kernel lifetime.
pub fn record_boot_info(handoff: &BootHandoff<'_>) {
    let _ = BOOT_INFO.init(BootInfo {
        framebuffer: handoff.framebuffer,
        program: handoff.program,
        command_line: String::from(handoff.command_line),
    });
}

/// Seed a frame allocator from the memory map. Usable rows become free
/// holes; everything else is preserved with a type the allocator tracks.
pub fn seed_frame_allocator(
    allocator: &mut FrameAllocator,
    memory_map: &[MemoryMapEntry],
) -> KernelResult<u64> {
    if memory_map.is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    let mut usable = 0u64;
    for entry in memory_map {
        if entry.frame_count == 0 || entry.base % FRAME_SIZE as u64 != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let base = PhysicalAddress::new(entry.base);
        match entry.entry_type {
            MemoryMapEntryType::Usable => {
                allocator
                    .add_free_region(base, entry.frame_count)
                    .map_err(KernelError::from)?;
                usable += entry.frame_count;
            }
            MemoryMapEntryType::Reserved | MemoryMapEntryType::Mmio => {
                allocator
                    .add_occupied_region(
                        base,
                        entry.frame_count,
                        FrameType::Reserved,
                        FrameAttributes::empty(),
                    )
                    .map_err(KernelError::from)?;
            }
            MemoryMapEntryType::AcpiReclaim => {
                allocator
                    .add_occupied_region(
                        base,
                        entry.frame_count,
                        FrameType::AcpiReclaim,
                        FrameAttributes::ACPI_RECLAIM,
                    )
                    .map_err(KernelError::from)?;
            }
            MemoryMapEntryType::AcpiCode => {
                allocator
                    .add_occupied_region(
                        base,
                        entry.frame_count,
                        FrameType::AcpiCode,
                        FrameAttributes::ACPI,
                    )
                    .map_err(KernelError::from)?;
            }
            MemoryMapEntryType::AcpiData => {
                allocator
                    .add_occupied_region(
                        base,
                        entry.frame_count,
                        FrameType::AcpiData,
                        FrameAttributes::ACPI,
                    )
                    .map_err(KernelError::from)?;
            }
        }
    }
    Ok(usable)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn entry(entry_type: MemoryMapEntryType, base: u64, frames: u64) -> MemoryMapEntry {
        MemoryMapEntry {
            entry_type,
            base,
            frame_count: frames,
            attributes: 0,
        }
    }

    #[test]
    fn test_seed_from_map() {
        let map = [
            entry(MemoryMapEntryType::Usable, 0x0, 256),
            entry(MemoryMapEntryType::Reserved, 0x100000, 16),
            entry(MemoryMapEntryType::AcpiReclaim, 0x110000, 8),
            entry(MemoryMapEntryType::Usable, 0x200000, 256),
        ];
        let mut fa = FrameAllocator::new();
        let usable = seed_frame_allocator(&mut fa, &map).unwrap();
        assert_eq!(usable, 512);
        assert_eq!(fa.free_frame_count(), 512);
        assert_eq!(fa.total_frame_count(), 536);

        // Reserved survives and answers point queries.
        assert!(fa
            .get_reserved_frames_of_address(PhysicalAddress::new(0x100000))
            .is_some());

        // ACPI reclaim sweeps into the free pool.
        fa.release_acpi_reclaim_memory();
        assert_eq!(fa.free_frame_count(), 520);
    }

    #[test]
    fn test_boot_info_singleton() {
        let handoff = BootHandoff {
            memory_map: &[entry(MemoryMapEntryType::Usable, 0, 1)],
            framebuffer: FramebufferInfo {
                base: 0x8000_0000,
                width: 1024,
                height: 768,
                pixels_per_scanline: 1024,
            },
            program: ProgramInfo::default(),
            command_line: "console=serial",
        };
        record_boot_info(&handoff);
        let info = BOOT_INFO.get();
        assert_eq!(info.command_line, "console=serial");
        assert_eq!(info.framebuffer.width, 1024);
        // A second record is ignored; the first installation wins.
        record_boot_info(&BootHandoff {
            command_line: "other",
            ..handoff
        });
        assert_eq!(BOOT_INFO.get().command_line, "console=serial");
    }

    #[test]
    fn test_bad_map_rejected() {
        let mut fa = FrameAllocator::new();
        assert!(seed_frame_allocator(&mut fa, &[]).is_err());
        let misaligned = [entry(MemoryMapEntryType::Usable, 0x123, 1)];
        assert!(seed_frame_allocator(&mut fa, &misaligned).is_err());
    }
}
