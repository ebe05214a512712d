//! Four-level page table construction and mapping
//!
//! The walk logic is generic over a [`TableSpace`], which hands out zeroed
//! table frames and resolves a table's physical address to a pointer. The
//! kernel implementation backs tables with reserved frames addressed through
//! the higher-half alias window; unit tests substitute an arena.
//!
//! Concurrent mapping of the same virtual address from two CPUs is undefined;
//! callers synchronize externally.

use alloc::vec::Vec;

use bitflags::bitflags;

use super::frame_allocator::{FrameAllocationFlags, FRAME_ALLOCATOR};
use super::page_table::{PageEntryFlags, PageTable, VirtualAddressParts};
use super::{Frame, PhysicalAddress, VirtualAddress, FRAME_SIZE};
use crate::error::{KernelError, KernelResult};

/// 2 MiB huge page span
pub const PAGE_2M: u64 = 2 * 1024 * 1024;
/// 1 GiB huge page span
pub const PAGE_1G: u64 = 1024 * 1024 * 1024;

bitflags! {
    /// Mapping attributes requested by callers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageAttributes: u32 {
        const WRITABLE = 1 << 0;
        const NO_EXECUTE = 1 << 1;
        const USER = 1 << 2;
        const HUGE_2M = 1 << 3;
        const HUGE_1G = 1 << 4;
        const WRITE_THROUGH = 1 << 5;
        const CACHE_DISABLE = 1 << 6;
    }
}

impl PageAttributes {
    fn entry_flags(self) -> PageEntryFlags {
        let mut flags = PageEntryFlags::PRESENT;
        if self.contains(PageAttributes::WRITABLE) {
            flags |= PageEntryFlags::WRITABLE;
        }
        if self.contains(PageAttributes::NO_EXECUTE) {
            flags |= PageEntryFlags::NO_EXECUTE;
        }
        if self.contains(PageAttributes::USER) {
            flags |= PageEntryFlags::USER;
        }
        if self.contains(PageAttributes::WRITE_THROUGH) {
            flags |= PageEntryFlags::WRITE_THROUGH;
        }
        if self.contains(PageAttributes::CACHE_DISABLE) {
            flags |= PageEntryFlags::CACHE_DISABLE;
        }
        flags
    }
}

/// Source of page table frames and physical-to-pointer resolution.
pub trait TableSpace {
    /// Allocate one zeroed, frame-aligned table.
    fn allocate_table(&mut self) -> KernelResult<PhysicalAddress>;

    /// Resolve a table's physical address to a dereferencable pointer.
    fn table_ptr(&self, pa: PhysicalAddress) -> *mut PageTable;
}

/// Kernel table space: tables live in reserved frames reached through the
/// higher-half alias window.
pub struct KernelTableSpace;

impl TableSpace for KernelTableSpace {
    fn allocate_table(&mut self) -> KernelResult<PhysicalAddress> {
        let frames = FRAME_ALLOCATOR
            .lock()
            .allocate_by_count(
                1,
                FrameAllocationFlags::BLOCK | FrameAllocationFlags::RESERVED,
            )
            .map_err(KernelError::from)?;
        let pa = frames[0].start;
        let ptr = self.table_ptr(pa);
        // SAFETY: The frame was just allocated exclusively for this table and
        // the alias window covers all reserved frames.
        unsafe { (*ptr).zero() };
        Ok(pa)
    }

    fn table_ptr(&self, pa: PhysicalAddress) -> *mut PageTable {
        super::va_for_reserved_fa(pa).as_u64() as *mut PageTable
    }
}

/// One four-level address space rooted at a PML4 frame.
pub struct AddressSpace {
    root: PhysicalAddress,
}

impl AddressSpace {
    /// Allocate an empty address space.
    pub fn new(space: &mut impl TableSpace) -> KernelResult<Self> {
        Ok(Self {
            root: space.allocate_table()?,
        })
    }

    /// Adopt an existing root (e.g. the table the bootloader handed over).
    pub const fn from_root(root: PhysicalAddress) -> Self {
        Self { root }
    }

    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Map `size` bytes at `va` onto `pa`. Huge attributes change the step.
    pub fn map(
        &mut self,
        space: &mut impl TableSpace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        size: u64,
        attrs: PageAttributes,
    ) -> KernelResult<()> {
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let step = if attrs.contains(PageAttributes::HUGE_1G) {
            PAGE_1G
        } else if attrs.contains(PageAttributes::HUGE_2M) {
            PAGE_2M
        } else {
            FRAME_SIZE as u64
        };
        if va.as_u64() % step != 0 || pa.as_u64() % step != 0 {
            return Err(KernelError::InvalidArgument);
        }

        let pages = size.div_ceil(step);
        for i in 0..pages {
            self.map_one(
                space,
                VirtualAddress::new(va.as_u64() + i * step),
                PhysicalAddress::new(pa.as_u64() + i * step),
                attrs,
            )?;
        }
        Ok(())
    }

    /// Map a frame run at `va` through its natural 4 KiB pages.
    pub fn add_va_for_frame(
        &mut self,
        space: &mut impl TableSpace,
        va: VirtualAddress,
        frame: &Frame,
        attrs: PageAttributes,
    ) -> KernelResult<()> {
        self.map(space, va, frame.start, frame.size_bytes(), attrs)?;
        let _ = FRAME_ALLOCATOR.lock().mark_page_mapped(frame.start);
        Ok(())
    }

    /// Unmap `size` bytes at `va`, returning the released physical pages and
    /// invalidating each virtual page.
    ///
    /// Unmapping a non-present page is state corruption and panics.
    pub fn unmap(
        &mut self,
        space: &impl TableSpace,
        va: VirtualAddress,
        size: u64,
    ) -> KernelResult<Vec<PhysicalAddress>> {
        if size == 0 || va.as_u64() % FRAME_SIZE as u64 != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut released = Vec::new();
        let mut cursor = va.as_u64();
        let end = va.as_u64() + size;
        while cursor < end {
            let page = VirtualAddress::new(cursor);
            let (pa, step) = self.unmap_one(space, page);
            released.push(pa);
            crate::arch::x86_64::mmu::invalidate_page(page);
            cursor += step;
        }
        Ok(released)
    }

    /// Flip the given attribute bits on the terminal entry mapping `va`.
    pub fn toggle_attributes(
        &mut self,
        space: &impl TableSpace,
        va: VirtualAddress,
        attr_mask: PageAttributes,
    ) -> KernelResult<()> {
        let entry = self
            .terminal_entry(space, va)
            .ok_or(KernelError::NotFound)?;
        // SAFETY: `terminal_entry` only returns pointers into live tables of
        // this address space.
        unsafe {
            let mut flags = (*entry).flags();
            for (attr, bit) in [
                (PageAttributes::WRITABLE, PageEntryFlags::WRITABLE),
                (PageAttributes::NO_EXECUTE, PageEntryFlags::NO_EXECUTE),
                (PageAttributes::USER, PageEntryFlags::USER),
                (PageAttributes::WRITE_THROUGH, PageEntryFlags::WRITE_THROUGH),
                (PageAttributes::CACHE_DISABLE, PageEntryFlags::CACHE_DISABLE),
            ] {
                if attr_mask.contains(attr) {
                    flags.toggle(bit);
                }
            }
            (*entry).set_flags(flags);
        }
        crate::arch::x86_64::mmu::invalidate_page(va);
        Ok(())
    }

    /// Resolve `va` to its physical address, honoring huge pages.
    pub fn translate(&self, space: &impl TableSpace, va: VirtualAddress) -> Option<PhysicalAddress> {
        let parts = VirtualAddressParts::new(va);
        let pml4 = space.table_ptr(self.root);

        // SAFETY: Table pointers come from the TableSpace and every level is
        // checked for presence before descending.
        unsafe {
            let pml4e = (&(*pml4))[parts.pml4_index];
            let pdpt = space.table_ptr(pml4e.addr()?);

            let pdpte = (&(*pdpt))[parts.pdpt_index];
            let pdpte_addr = pdpte.addr()?;
            if pdpte.is_huge() {
                let offset = va.as_u64() & (PAGE_1G - 1);
                return Some(PhysicalAddress::new(pdpte_addr.as_u64() + offset));
            }
            let pd = space.table_ptr(pdpte_addr);

            let pde = (&(*pd))[parts.pd_index];
            let pde_addr = pde.addr()?;
            if pde.is_huge() {
                let offset = va.as_u64() & (PAGE_2M - 1);
                return Some(PhysicalAddress::new(pde_addr.as_u64() + offset));
            }
            let pt = space.table_ptr(pde_addr);

            let pte = (&(*pt))[parts.pt_index];
            let page = pte.addr()?;
            Some(PhysicalAddress::new(page.as_u64() + parts.page_offset))
        }
    }

    fn map_one(
        &mut self,
        space: &mut impl TableSpace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        attrs: PageAttributes,
    ) -> KernelResult<()> {
        let parts = VirtualAddressParts::new(va);
        let flags = attrs.entry_flags();
        let intermediate = {
            let mut f = PageEntryFlags::PRESENT | PageEntryFlags::WRITABLE;
            if attrs.contains(PageAttributes::USER) {
                f |= PageEntryFlags::USER;
            }
            f
        };

        // SAFETY: Pointers resolve through the TableSpace; new tables are
        // zeroed before they are linked in.
        unsafe {
            let pml4 = space.table_ptr(self.root);
            let pdpt_pa = Self::descend(space, &mut (&mut (*pml4))[parts.pml4_index], intermediate)?;
            let pdpt = space.table_ptr(pdpt_pa);

            if attrs.contains(PageAttributes::HUGE_1G) {
                let entry = &mut (&mut (*pdpt))[parts.pdpt_index];
                if entry.is_present() {
                    return Err(KernelError::AlreadyExists);
                }
                entry.set(pa, flags | PageEntryFlags::HUGE);
                return Ok(());
            }

            let pd_pa = Self::descend(space, &mut (&mut (*pdpt))[parts.pdpt_index], intermediate)?;
            let pd = space.table_ptr(pd_pa);

            if attrs.contains(PageAttributes::HUGE_2M) {
                let entry = &mut (&mut (*pd))[parts.pd_index];
                if entry.is_present() {
                    return Err(KernelError::AlreadyExists);
                }
                entry.set(pa, flags | PageEntryFlags::HUGE);
                return Ok(());
            }

            let pt_pa = Self::descend(space, &mut (&mut (*pd))[parts.pd_index], intermediate)?;
            let pt = space.table_ptr(pt_pa);

            let entry = &mut (&mut (*pt))[parts.pt_index];
            if entry.is_present() {
                return Err(KernelError::AlreadyExists);
            }
            entry.set(pa, flags);
        }
        Ok(())
    }

    /// Clear the terminal entry for `va`; returns (pa, span).
    fn unmap_one(&mut self, space: &impl TableSpace, va: VirtualAddress) -> (PhysicalAddress, u64) {
        let parts = VirtualAddressParts::new(va);

        // SAFETY: Presence is checked at every level; a missing entry is an
        // invariant violation and panics below.
        unsafe {
            let pml4 = space.table_ptr(self.root);
            let pml4e = (&(*pml4))[parts.pml4_index];
            let pdpt = match pml4e.addr() {
                Some(a) => space.table_ptr(a),
                None => panic!("unmap of unmapped address {:#x}", va.as_u64()),
            };

            let pdpte = &mut (&mut (*pdpt))[parts.pdpt_index];
            match pdpte.addr() {
                Some(a) if pdpte.is_huge() => {
                    pdpte.clear();
                    return (a, PAGE_1G);
                }
                Some(a) => {
                    let pd = space.table_ptr(a);
                    let pde = &mut (&mut (*pd))[parts.pd_index];
                    match pde.addr() {
                        Some(a) if pde.is_huge() => {
                            pde.clear();
                            (a, PAGE_2M)
                        }
                        Some(a) => {
                            let pt = space.table_ptr(a);
                            let pte = &mut (&mut (*pt))[parts.pt_index];
                            match pte.addr() {
                                Some(page) => {
                                    pte.clear();
                                    (page, FRAME_SIZE as u64)
                                }
                                None => {
                                    panic!("unmap of non-present pte at {:#x}", va.as_u64())
                                }
                            }
                        }
                        None => panic!("unmap of unmapped address {:#x}", va.as_u64()),
                    }
                }
                None => panic!("unmap of unmapped address {:#x}", va.as_u64()),
            }
        }
    }

    fn terminal_entry(
        &self,
        space: &impl TableSpace,
        va: VirtualAddress,
    ) -> Option<*mut super::page_table::PageTableEntry> {
        let parts = VirtualAddressParts::new(va);
        // SAFETY: Presence checked level by level.
        unsafe {
            let pml4 = space.table_ptr(self.root);
            let pdpt = space.table_ptr((&(*pml4))[parts.pml4_index].addr()?);
            let pdpte = &mut (&mut (*pdpt))[parts.pdpt_index];
            let pdpte_addr = pdpte.addr()?;
            if pdpte.is_huge() {
                return Some(pdpte as *mut _);
            }
            let pd = space.table_ptr(pdpte_addr);
            let pde = &mut (&mut (*pd))[parts.pd_index];
            let pde_addr = pde.addr()?;
            if pde.is_huge() {
                return Some(pde as *mut _);
            }
            let pt = space.table_ptr(pde_addr);
            let pte = &mut (&mut (*pt))[parts.pt_index];
            pte.addr()?;
            Some(pte as *mut _)
        }
    }

    /// Follow (or create) the next-level table below `entry`.
    ///
    /// # Safety
    ///
    /// `entry` must point into a live table resolved through `space`.
    unsafe fn descend(
        space: &mut impl TableSpace,
        entry: &mut super::page_table::PageTableEntry,
        intermediate: PageEntryFlags,
    ) -> KernelResult<PhysicalAddress> {
        if let Some(addr) = entry.addr() {
            if entry.is_huge() {
                return Err(KernelError::AlreadyExists);
            }
            // Widen intermediate permissions if this mapping needs more.
            entry.set_flags(entry.flags() | intermediate);
            return Ok(addr);
        }
        let table = space.allocate_table()?;
        entry.set(table, intermediate);
        Ok(table)
    }
}

/// Switch CR3 to `root`, returning the old root. Full TLB reload.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn switch_table(root: PhysicalAddress) -> PhysicalAddress {
    let old = crate::arch::x86_64::mmu::read_cr3();
    crate::arch::x86_64::mmu::write_cr3(root);
    old
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::boxed::Box;
    use alloc::collections::BTreeMap;
    use core::cell::UnsafeCell;

    use super::*;

    /// Arena-backed table space: fake physical addresses index a map of
    /// heap-allocated tables.
    struct ArenaSpace {
        tables: BTreeMap<u64, Box<UnsafeCell<PageTable>>>,
        next: u64,
    }

    impl ArenaSpace {
        fn new() -> Self {
            Self {
                tables: BTreeMap::new(),
                next: 0x100_0000,
            }
        }
    }

    impl TableSpace for ArenaSpace {
        fn allocate_table(&mut self) -> KernelResult<PhysicalAddress> {
            let pa = self.next;
            self.next += FRAME_SIZE as u64;
            self.tables
                .insert(pa, Box::new(UnsafeCell::new(PageTable::new())));
            Ok(PhysicalAddress::new(pa))
        }

        fn table_ptr(&self, pa: PhysicalAddress) -> *mut PageTable {
            self.tables
                .get(&pa.as_u64())
                .expect("walk resolved a table the arena never allocated")
                .get()
        }
    }

    #[test]
    fn test_map_translate_unmap_round_trip() {
        let mut space = ArenaSpace::new();
        let mut aspace = AddressSpace::new(&mut space).unwrap();
        let va = VirtualAddress::new(0xFFFF_8000_0000_0000);
        let pa = PhysicalAddress::new(0x100000);

        aspace
            .map(
                &mut space,
                va,
                pa,
                FRAME_SIZE as u64,
                PageAttributes::WRITABLE | PageAttributes::NO_EXECUTE,
            )
            .expect("mapping a single page should succeed");
        assert_eq!(aspace.translate(&space, va), Some(pa));
        assert_eq!(
            aspace.translate(&space, VirtualAddress::new(va.as_u64() + 0x123)),
            Some(PhysicalAddress::new(0x100123))
        );

        let released = aspace
            .unmap(&space, va, FRAME_SIZE as u64)
            .expect("unmap of a mapped page should succeed");
        assert_eq!(released, alloc::vec![pa]);
        assert_eq!(aspace.translate(&space, va), None);
    }

    #[test]
    fn test_double_map_is_rejected() {
        let mut space = ArenaSpace::new();
        let mut aspace = AddressSpace::new(&mut space).unwrap();
        let va = VirtualAddress::new(0x40_0000);
        aspace
            .map(&mut space, va, PhysicalAddress::new(0x1000), 4096, PageAttributes::WRITABLE)
            .unwrap();
        let err = aspace
            .map(&mut space, va, PhysicalAddress::new(0x2000), 4096, PageAttributes::WRITABLE)
            .unwrap_err();
        assert_eq!(err, KernelError::AlreadyExists);
    }

    #[test]
    fn test_huge_2m_mapping() {
        let mut space = ArenaSpace::new();
        let mut aspace = AddressSpace::new(&mut space).unwrap();
        let va = VirtualAddress::new(0x4000_0000);
        let pa = PhysicalAddress::new(0x20_0000);
        aspace
            .map(
                &mut space,
                va,
                pa,
                PAGE_2M,
                PageAttributes::WRITABLE | PageAttributes::HUGE_2M,
            )
            .expect("2 MiB huge mapping should succeed");
        // Offsets inside the huge page resolve without a PT level
        assert_eq!(
            aspace.translate(&space, VirtualAddress::new(va.as_u64() + 0x12345)),
            Some(PhysicalAddress::new(pa.as_u64() + 0x12345))
        );
        let released = aspace.unmap(&space, va, PAGE_2M).unwrap();
        assert_eq!(released, alloc::vec![pa]);
    }

    #[test]
    fn test_multi_page_map() {
        let mut space = ArenaSpace::new();
        let mut aspace = AddressSpace::new(&mut space).unwrap();
        let va = VirtualAddress::new(0x50_0000);
        let pa = PhysicalAddress::new(0x80_0000);
        aspace
            .map(&mut space, va, pa, 4 * FRAME_SIZE as u64, PageAttributes::WRITABLE)
            .unwrap();
        for i in 0..4u64 {
            assert_eq!(
                aspace.translate(&space, VirtualAddress::new(va.as_u64() + i * 4096)),
                Some(PhysicalAddress::new(pa.as_u64() + i * 4096))
            );
        }
    }

    #[test]
    fn test_toggle_attributes() {
        let mut space = ArenaSpace::new();
        let mut aspace = AddressSpace::new(&mut space).unwrap();
        let va = VirtualAddress::new(0x60_0000);
        aspace
            .map(&mut space, va, PhysicalAddress::new(0x3000), 4096, PageAttributes::WRITABLE)
            .unwrap();
        aspace
            .toggle_attributes(&space, va, PageAttributes::WRITABLE | PageAttributes::NO_EXECUTE)
            .expect("toggle on a mapped page should succeed");
        let entry = aspace.terminal_entry(&space, va).unwrap();
        let flags = unsafe { (*entry).flags() };
        assert!(!flags.contains(PageEntryFlags::WRITABLE));
        assert!(flags.contains(PageEntryFlags::NO_EXECUTE));
    }

    #[test]
    #[should_panic(expected = "unmap")]
    fn test_unmap_nonpresent_panics() {
        let mut space = ArenaSpace::new();
        let mut aspace = AddressSpace::new(&mut space).unwrap();
        let _ = aspace.unmap(&space, VirtualAddress::new(0x70_0000), 4096);
    }
}
