//! Global Descriptor Table and TSS
//!
//! Layout: null, kernel code (0x08), kernel data (0x10), TSS (0x18, two
//! slots), user data (0x28), user code (0x30). The TSS carries `rsp0` plus
//! all seven IST stacks; exception handlers that must be re-entrant get their
//! own stack.

use lazy_static::lazy_static;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

/// IST indices by consumer.
pub const IST_NMI: u16 = 0;
pub const IST_DOUBLE_FAULT: u16 = 1;
pub const IST_MACHINE_CHECK: u16 = 2;
pub const IST_DEBUG: u16 = 3;
pub const IST_PAGE_FAULT: u16 = 4;
pub const IST_SPILL_A: u16 = 5;
pub const IST_SPILL_B: u16 = 6;

const IST_STACK_SIZE: usize = 4096 * 5;

#[repr(align(16))]
struct AlignedStack([u8; IST_STACK_SIZE]);

macro_rules! ist_stack {
    ($tss:expr, $index:expr) => {{
        static mut STACK: AlignedStack = AlignedStack([0; IST_STACK_SIZE]);
        let stack_ptr = &raw const STACK;
        let stack_start = VirtAddr::from_ptr(stack_ptr);
        $tss.interrupt_stack_table[$index as usize] = stack_start + IST_STACK_SIZE as u64;
    }};
}

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        // Ring 0 stack used on privilege transitions. Must stay 16-byte
        // aligned for movaps in compiler-generated code.
        tss.privilege_stack_table[0] = {
            static mut KERNEL_STACK: AlignedStack = AlignedStack([0; IST_STACK_SIZE]);
            let stack_ptr = &raw const KERNEL_STACK;
            VirtAddr::from_ptr(stack_ptr) + IST_STACK_SIZE as u64
        };

        ist_stack!(tss, IST_NMI);
        ist_stack!(tss, IST_DOUBLE_FAULT);
        ist_stack!(tss, IST_MACHINE_CHECK);
        ist_stack!(tss, IST_DEBUG);
        ist_stack!(tss, IST_PAGE_FAULT);
        ist_stack!(tss, IST_SPILL_A);
        ist_stack!(tss, IST_SPILL_B);
        tss
    };
}

struct Selectors {
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    tss: SegmentSelector,
    user_data: SegmentSelector,
    user_code: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment()); // 0x08
        let kernel_data = gdt.append(Descriptor::kernel_data_segment()); // 0x10
        let tss = gdt.append(Descriptor::tss_segment(&TSS)); // 0x18 (2 slots)
        let user_data = gdt.append(Descriptor::user_data_segment()); // 0x28
        let user_code = gdt.append(Descriptor::user_code_segment()); // 0x30
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                tss,
                user_data,
                user_code,
            },
        )
    };
}

/// Kernel code selector (used by the syscall STAR programming).
pub fn kernel_code_selector() -> SegmentSelector {
    GDT.1.kernel_code
}

pub fn kernel_data_selector() -> SegmentSelector {
    GDT.1.kernel_data
}

pub fn user_data_selector() -> SegmentSelector {
    GDT.1.user_data
}

pub fn user_code_selector() -> SegmentSelector {
    GDT.1.user_code
}

/// Load GDT, segment registers and the task register.
#[cfg(target_os = "none")]
pub fn init() {
    use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
    use x86_64::instructions::tables::load_tss;

    GDT.0.load();
    // SAFETY: The selectors reference entries of the GDT that was just
    // loaded and stays resident for the kernel lifetime.
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        SS::set_reg(GDT.1.kernel_data);
        DS::set_reg(GDT.1.kernel_data);
        ES::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
    crate::klog!(Interrupt, Info, "gdt and tss loaded");
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_selector_layout() {
        assert_eq!(kernel_code_selector().0, 0x08);
        assert_eq!(kernel_data_selector().0, 0x10);
        assert_eq!(GDT.1.tss.0, 0x18);
        assert_eq!(user_data_selector().0 & !0x3, 0x28);
        assert_eq!(user_code_selector().0 & !0x3, 0x30);
    }

    #[test]
    fn test_all_seven_ist_stacks_distinct() {
        let mut stacks: alloc::vec::Vec<u64> = (0..7)
            .map(|i| TSS.interrupt_stack_table[i].as_u64())
            .collect();
        stacks.push(TSS.privilege_stack_table[0].as_u64());
        for s in &stacks {
            assert_ne!(*s, 0);
        }
        stacks.sort_unstable();
        stacks.dedup();
        assert_eq!(stacks.len(), 8, "ist stacks must not alias");
    }
}
