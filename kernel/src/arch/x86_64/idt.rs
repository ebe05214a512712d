//! Interrupt Descriptor Table and ISR dispatch
//!
//! 256 entries; exceptions get dedicated handlers (re-entrant ones on their
//! own IST stacks), hardware and software vectors dispatch through a
//! runtime-registered handler table.

use core::sync::atomic::{AtomicUsize, Ordering};

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::gdt;

/// Timer tick vector (PIC IRQ0 remapped).
pub const TIMER_VECTOR: u8 = 32;
/// Software vector a task raises to enter the scheduler voluntarily.
pub const YIELD_VECTOR: u8 = 0x80;
/// Vector for the cross-CPU scheduler kick.
pub const SCHEDULER_IPI_VECTOR: u8 = super::SCHEDULER_IPI_VECTOR;

/// Registered handler per vector, stored as a `fn(u8)` pointer.
static HANDLERS: [AtomicUsize; 256] = [const { AtomicUsize::new(0) }; 256];

/// Register a handler for a vector; returns the previous one if any.
pub fn set_irq_handler(vector: u8, handler: fn(u8)) -> Option<fn(u8)> {
    let old = HANDLERS[vector as usize].swap(handler as usize, Ordering::AcqRel);
    if old == 0 {
        None
    } else {
        // SAFETY: Only `fn(u8)` pointers are ever stored in the table.
        Some(unsafe { core::mem::transmute::<usize, fn(u8)>(old) })
    }
}

/// Dispatch a vector through the handler table.
pub fn dispatch(vector: u8) {
    let raw = HANDLERS[vector as usize].load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: Only `fn(u8)` pointers are ever stored in the table.
        let handler: fn(u8) = unsafe { core::mem::transmute(raw) };
        handler(vector);
    } else {
        crate::klog!(Interrupt, Warning, "spurious vector {:#x}", vector);
    }
    if (32..48).contains(&vector) {
        super::timer::pic_eoi(vector);
    }
    super::apic_eoi();
}

macro_rules! vectored_handler {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
            dispatch($vector);
        }
    };
}

vectored_handler!(vector_32, 32);
vectored_handler!(vector_33, 33);
vectored_handler!(vector_34, 34);
vectored_handler!(vector_35, 35);
vectored_handler!(vector_36, 36);
vectored_handler!(vector_37, 37);
vectored_handler!(vector_38, 38);
vectored_handler!(vector_39, 39);
vectored_handler!(vector_40, 40);
vectored_handler!(vector_41, 41);
vectored_handler!(vector_42, 42);
vectored_handler!(vector_43, 43);
vectored_handler!(vector_44, 44);
vectored_handler!(vector_45, 45);
vectored_handler!(vector_46, 46);
vectored_handler!(vector_47, 47);
vectored_handler!(vector_yield, YIELD_VECTOR);
vectored_handler!(vector_sched_ipi, SCHEDULER_IPI_VECTOR);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        // SAFETY: The IST indices name stacks installed by gdt::init.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::IST_DOUBLE_FAULT);
            idt.non_maskable_interrupt
                .set_handler_fn(nmi_handler)
                .set_stack_index(gdt::IST_NMI);
            idt.machine_check
                .set_handler_fn(machine_check_handler)
                .set_stack_index(gdt::IST_MACHINE_CHECK);
            idt.debug
                .set_handler_fn(debug_handler)
                .set_stack_index(gdt::IST_DEBUG);
            // Page faults can fire inside the VMX entry path; a dedicated
            // stack keeps the handler re-entrant.
            idt.page_fault
                .set_handler_fn(page_fault_handler)
                .set_stack_index(gdt::IST_PAGE_FAULT);
        }

        idt[32].set_handler_fn(vector_32);
        idt[33].set_handler_fn(vector_33);
        idt[34].set_handler_fn(vector_34);
        idt[35].set_handler_fn(vector_35);
        idt[36].set_handler_fn(vector_36);
        idt[37].set_handler_fn(vector_37);
        idt[38].set_handler_fn(vector_38);
        idt[39].set_handler_fn(vector_39);
        idt[40].set_handler_fn(vector_40);
        idt[41].set_handler_fn(vector_41);
        idt[42].set_handler_fn(vector_42);
        idt[43].set_handler_fn(vector_43);
        idt[44].set_handler_fn(vector_44);
        idt[45].set_handler_fn(vector_45);
        idt[46].set_handler_fn(vector_46);
        idt[47].set_handler_fn(vector_47);
        idt[YIELD_VECTOR].set_handler_fn(vector_yield);
        idt[SCHEDULER_IPI_VECTOR].set_handler_fn(vector_sched_ipi);
        idt
    };
}

/// Load the IDT and wire the scheduler vectors.
#[cfg(target_os = "none")]
pub fn init() {
    IDT.load();
    set_irq_handler(TIMER_VECTOR, timer_irq);
    set_irq_handler(YIELD_VECTOR, scheduler_irq);
    set_irq_handler(SCHEDULER_IPI_VECTOR, scheduler_irq);
    crate::klog!(Interrupt, Info, "idt loaded, 256 vectors");
}

#[cfg(target_os = "none")]
fn timer_irq(_vector: u8) {
    super::timer::tick();
}

#[cfg(target_os = "none")]
fn scheduler_irq(_vector: u8) {
    crate::sched::SCHEDULER.yield_on(super::current_cpu_id());
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    crate::klog!(Interrupt, Warning, "breakpoint at {:?}", stack_frame.instruction_pointer);
}

extern "x86-interrupt" fn debug_handler(stack_frame: InterruptStackFrame) {
    crate::klog!(Interrupt, Warning, "debug exception at {:?}", stack_frame.instruction_pointer);
}

extern "x86-interrupt" fn nmi_handler(_stack_frame: InterruptStackFrame) {
    crate::klog!(Interrupt, Error, "non-maskable interrupt");
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("double fault\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn machine_check_handler(stack_frame: InterruptStackFrame) -> ! {
    panic!("machine check\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    #[cfg(target_os = "none")]
    let addr = x86_64::registers::control::Cr2::read();
    #[cfg(not(target_os = "none"))]
    let addr = 0u64;
    panic!(
        "page fault at {:?} accessing {:?} ({:?})",
        stack_frame.instruction_pointer, addr, error_code
    );
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    panic!(
        "general protection fault {:#x}\n{:#?}",
        error_code, stack_frame
    );
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_handler_registration() {
        fn h(_v: u8) {}
        assert!(set_irq_handler(200, h).is_none());
        let old = set_irq_handler(200, h).expect("second registration returns the first");
        assert_eq!(old as usize, h as usize);
    }
}
