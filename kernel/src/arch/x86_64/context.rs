//! Context switch
//!
//! Cooperative switches save the callee-saved register file, RFLAGS, RSP and
//! a resume RIP into the outgoing task, `fxsave` the FP/SSE state into its
//! 512-byte area, then load the incoming task with `fxrstor` and `ret` into
//! its saved RIP. Caller-saved registers are dead across the call per the
//! System V ABI; the preemption path re-enters through the interrupt frame.
//!
//! A task that has never run resumes at [`task_entry_trampoline`], which
//! acknowledges the interrupt, calls the task entry and falls into
//! `end_task` on return.

use crate::sched::task::Task;

/// First-run RFLAGS: IF set, reserved bit 1 set.
const INITIAL_RFLAGS: u64 = 0x202;

/// Prepare a freshly created task so the first switch into it lands in the
/// entry trampoline on its own stack.
pub fn prepare_first_run(task: &mut Task) {
    let top = task.stack_top() & !0xF;
    task.registers.rsp = top - 8;
    task.registers.rbp = top;
    task.registers.rip = task_entry_trampoline as usize as u64;
    task.registers.rflags = INITIAL_RFLAGS;
    task.registers.rdi = task.argc;
    task.registers.rsi = task.argv;
}

/// First instruction stream of every task: EOI for the switch interrupt,
/// enable interrupts, run the entry, then retire through the cleaner queue.
extern "C" fn task_entry_trampoline() -> ! {
    super::apic_eoi();
    #[cfg(target_os = "none")]
    super::mmu::sti();

    let cpu = super::current_cpu_id();
    let entry = crate::sched::SCHEDULER
        .current_on(cpu)
        .and_then(|id| crate::sched::SCHEDULER.with_task(id, |t| t.entry));
    if let Some(entry) = entry {
        entry();
    }

    crate::sched::SCHEDULER.end_task(cpu);
    // Unreachable once another task takes the CPU; park defensively.
    loop {
        #[cfg(target_os = "none")]
        super::mmu::halt();
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }
}

/// Switch from `prev` to `next`.
///
/// # Safety
///
/// Both pointers must reference live tasks that stay pinned for the duration
/// of the switch; `next` must either have been prepared by
/// [`prepare_first_run`] or have a register file saved by a previous switch.
#[cfg(target_os = "none")]
pub unsafe fn switch_context(prev: *mut Task, next: *mut Task) {
    // Offsets into SavedRegisters; the layout is frozen (see sched::task).
    // rbx 0x08, r12 0x40, r13 0x48, r14 0x50, r15 0x58, rbp 0x70,
    // rsp 0x78, rflags 0x80, rip 0x88.
    // SAFETY: Caller guarantees both tasks are pinned; the register areas and
    // FX areas are plain memory inside the task structs.
    unsafe {
        let save = &raw mut (*prev).registers as *mut u8;
        let load = &raw const (*next).registers as *const u8;
        let sfx = (*prev).fx_state.0.as_mut_ptr();
        let lfx = (*next).fx_state.0.as_ptr();

        core::arch::asm!(
            "fxsave [r8]",
            "mov [rsi + 0x08], rbx",
            "mov [rsi + 0x40], r12",
            "mov [rsi + 0x48], r13",
            "mov [rsi + 0x50], r14",
            "mov [rsi + 0x58], r15",
            "mov [rsi + 0x70], rbp",
            "pushfq",
            "pop r10",
            "mov [rsi + 0x80], r10",
            "lea r10, [rip + 2f]",
            "mov [rsi + 0x88], r10",
            "mov [rsi + 0x78], rsp",
            "fxrstor [r9]",
            "mov rsp, [rdi + 0x78]",
            "mov r10, [rdi + 0x88]",
            "push r10",
            "mov r10, [rdi + 0x80]",
            "push r10",
            "popfq",
            "mov rbx, [rdi + 0x08]",
            "mov r12, [rdi + 0x40]",
            "mov r13, [rdi + 0x48]",
            "mov r14, [rdi + 0x50]",
            "mov r15, [rdi + 0x58]",
            "mov rbp, [rdi + 0x70]",
            "ret",
            "2:",
            inout("rsi") save => _,
            inout("rdi") load => _,
            inout("r8") sfx => _,
            inout("r9") lfx => _,
            out("r10") _,
            out("rax") _,
            out("rcx") _,
            out("rdx") _,
            out("r11") _,
            out("r12") _,
            out("r13") _,
            out("r14") _,
            out("r15") _,
        );
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::string::ToString;

    use super::*;

    fn noop() {}

    #[test]
    fn test_first_run_frame() {
        let mut task = Task::new(9, "t".to_string(), noop, 4096);
        task.argc = 2;
        task.argv = 0x1234;
        prepare_first_run(&mut task);

        assert_eq!(task.registers.rflags, INITIAL_RFLAGS);
        assert_eq!(task.registers.rip, task_entry_trampoline as usize as u64);
        assert_eq!(task.registers.rdi, 2);
        assert_eq!(task.registers.rsi, 0x1234);
        // rsp inside the stack, aligned so the trampoline sees rsp % 16 == 8.
        assert!(task.registers.rsp > task.stack_bottom());
        assert!(task.registers.rsp < task.stack_top());
        assert_eq!(task.registers.rsp % 16, 8);
    }
}
