//! syscall/sysret entry
//!
//! RIP and RFLAGS arrive in RCX/R11 per the ABI. The entry stub moves onto a
//! scratch kernel stack, saves the caller's registers, dispatches through a
//! table indexed by RAX and returns the result in RAX (`u64::MAX` for
//! errors).

use core::sync::atomic::{AtomicUsize, Ordering};

use super::msr;

/// Syscall numbers defined so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SyscallNumber {
    Hlt = 0x01,
    CliAndHlt = 0x02,
}

/// Error return value (-1).
pub const SYSCALL_ERROR: u64 = u64::MAX;

/// Handler signature: six integer arguments, result in RAX.
pub type SyscallHandler = fn(u64, u64, u64, u64, u64, u64) -> u64;

const SYSCALL_TABLE_SIZE: usize = 64;

static SYSCALL_TABLE: [AtomicUsize; SYSCALL_TABLE_SIZE] =
    [const { AtomicUsize::new(0) }; SYSCALL_TABLE_SIZE];

/// Register a syscall handler.
pub fn set_handler(number: u64, handler: SyscallHandler) -> bool {
    if number as usize >= SYSCALL_TABLE_SIZE {
        return false;
    }
    SYSCALL_TABLE[number as usize].store(handler as usize, Ordering::Release);
    true
}

/// Table-driven dispatch. Shared by the asm entry and the tests.
pub extern "C" fn syscall_dispatch(
    number: u64,
    a1: u64,
    a2: u64,
    a3: u64,
    a4: u64,
    a5: u64,
    a6: u64,
) -> u64 {
    if number as usize >= SYSCALL_TABLE_SIZE {
        return SYSCALL_ERROR;
    }
    let raw = SYSCALL_TABLE[number as usize].load(Ordering::Acquire);
    if raw == 0 {
        return SYSCALL_ERROR;
    }
    // SAFETY: Only `SyscallHandler` pointers are stored in the table.
    let handler: SyscallHandler = unsafe { core::mem::transmute(raw) };
    handler(a1, a2, a3, a4, a5, a6)
}

fn sys_hlt(_a1: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> u64 {
    #[cfg(target_os = "none")]
    super::mmu::halt();
    0
}

fn sys_cli_and_hlt(_a1: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> u64 {
    #[cfg(target_os = "none")]
    {
        super::mmu::cli();
        super::mmu::halt();
    }
    0
}

/// Scratch stack the entry stub lands on; one per CPU once SMP is up, the
/// BSP slot until then.
#[cfg(target_os = "none")]
#[repr(align(16))]
struct ScratchStack([u8; 4096 * 4]);

#[cfg(target_os = "none")]
static mut SYSCALL_SCRATCH_STACK: ScratchStack = ScratchStack([0; 4096 * 4]);

#[cfg(target_os = "none")]
static mut SYSCALL_SAVED_USER_RSP: u64 = 0;

#[cfg(target_os = "none")]
core::arch::global_asm!(
    ".global syscall_entry",
    "syscall_entry:",
    // RCX = user RIP, R11 = user RFLAGS. Hop onto the scratch stack, then
    // push the caller's GP registers and FX state.
    "mov [rip + {user_rsp}], rsp",
    "lea rsp, [rip + {scratch} + 16384]",
    "push qword ptr [rip + {user_rsp}]",
    "push rcx",
    "push r11",
    "push rdi",
    "push rsi",
    "push rdx",
    "push r10",
    "push r8",
    "push r9",
    // 520 keeps the fxsave area 16-aligned after the nine pushes above.
    "sub rsp, 520",
    "fxsave [rsp]",
    // dispatch(number=rax, a1=rdi, a2=rsi, a3=rdx, a4=r10, a5=r8, a6=r9);
    // the seventh C argument travels on the stack, padded so the callee
    // sees an ABI-aligned frame.
    "sub rsp, 8",
    "push r9",
    "mov r9, r8",
    "mov r8, r10",
    "mov rcx, rdx",
    "mov rdx, rsi",
    "mov rsi, rdi",
    "mov rdi, rax",
    "call {dispatch}",
    "add rsp, 16",
    "fxrstor [rsp]",
    "add rsp, 520",
    "pop r9",
    "pop r8",
    "pop r10",
    "pop rdx",
    "pop rsi",
    "pop rdi",
    "pop r11",
    "pop rcx",
    "pop rsp",
    "sysretq",
    user_rsp = sym SYSCALL_SAVED_USER_RSP,
    scratch = sym SYSCALL_SCRATCH_STACK,
    dispatch = sym syscall_dispatch,
);

/// Program the syscall MSRs and install the built-in handlers.
#[cfg(target_os = "none")]
pub fn init() {
    use super::gdt;

    extern "C" {
        fn syscall_entry();
    }

    set_handler(SyscallNumber::Hlt as u64, sys_hlt);
    set_handler(SyscallNumber::CliAndHlt as u64, sys_cli_and_hlt);

    // SAFETY: Programming the architected syscall MSRs with selectors from
    // our live GDT and our entry stub.
    unsafe {
        // EFER.SCE enables syscall/sysret.
        let efer = msr::read_msr(msr::IA32_EFER);
        msr::write_msr(msr::IA32_EFER, efer | 1);

        // STAR: kernel CS for syscall, user CS base for sysret.
        let kernel_cs = gdt::kernel_code_selector().0 as u64;
        let user_base = (gdt::user_data_selector().0 as u64 - 8) | 3;
        msr::write_msr(msr::IA32_STAR, (user_base << 48) | (kernel_cs << 32));

        msr::write_msr(msr::IA32_LSTAR, syscall_entry as usize as u64);
        // Mask IF and DF on entry.
        msr::write_msr(msr::IA32_FMASK, 0x600);
    }
    crate::klog!(Interrupt, Info, "syscall entry installed");
}

#[cfg(not(target_os = "none"))]
pub fn init() {
    set_handler(SyscallNumber::Hlt as u64, sys_hlt);
    set_handler(SyscallNumber::CliAndHlt as u64, sys_cli_and_hlt);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_number_returns_error() {
        assert_eq!(syscall_dispatch(63, 0, 0, 0, 0, 0, 0), SYSCALL_ERROR);
        assert_eq!(syscall_dispatch(9999, 0, 0, 0, 0, 0, 0), SYSCALL_ERROR);
    }

    #[test]
    fn test_registered_handler_receives_arguments() {
        fn echo_sum(a: u64, b: u64, c: u64, d: u64, e: u64, f: u64) -> u64 {
            a + b + c + d + e + f
        }
        assert!(set_handler(40, echo_sum));
        assert_eq!(syscall_dispatch(40, 1, 2, 3, 4, 5, 6), 21);
    }

    #[test]
    fn test_builtin_numbers() {
        init();
        assert_eq!(syscall_dispatch(SyscallNumber::Hlt as u64, 0, 0, 0, 0, 0, 0), 0);
        assert_eq!(
            syscall_dispatch(SyscallNumber::CliAndHlt as u64, 0, 0, 0, 0, 0, 0),
            0
        );
    }

    #[test]
    fn test_out_of_range_registration_rejected() {
        fn h(_: u64, _: u64, _: u64, _: u64, _: u64, _: u64) -> u64 {
            0
        }
        assert!(!set_handler(64, h));
    }
}
