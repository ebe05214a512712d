//! Task control block

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use super::TaskId;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Runnable,
    Running,
    Sleeping,
    WaitingMessage,
    WaitingFuture,
    WaitingInterrupt,
    Zombie,
}

/// FXSAVE area. 512 bytes, 16-byte aligned as `fxsave` demands.
#[repr(C, align(16))]
pub struct FxState(pub [u8; 512]);

impl FxState {
    pub const fn new() -> Self {
        Self([0; 512])
    }
}

impl Default for FxState {
    fn default() -> Self {
        Self::new()
    }
}

/// Register save area. The field order is ABI-frozen: the context switch
/// assembly stores and loads by offset.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub rip: u64,
}

/// A byte stream attached to a task (stdin/stdout/stderr equivalents).
pub type ByteStream = Arc<Mutex<Vec<u8>>>;

/// Task control block.
pub struct Task {
    pub id: TaskId,
    pub cpu_id: u64,
    pub name: String,
    pub state: TaskState,
    /// Entry point, used once on first dispatch.
    pub entry: fn(),
    pub argc: u64,
    pub argv: u64,
    /// Kernel stack backing storage; the range is [base, base+len).
    pub stack: Box<[u8]>,
    pub registers: SavedRegisters,
    pub fx_state: Box<FxState>,
    pub page_table_root: u64,
    /// Tick at which this task last got the CPU.
    pub last_tick: u64,
    /// Sleeping tasks wake when the epoch tick reaches this.
    pub wake_tick: u64,
    pub interruptible: bool,
    pub message_waiting: bool,
    pub interrupt_received: bool,
    pub input: ByteStream,
    pub output: ByteStream,
    pub error: ByteStream,
    /// Physical address of the VMCS when this task hosts a guest.
    pub vmcs_physical_address: Option<u64>,
    /// Id of the VM this task drives, if any.
    pub vm_id: Option<u64>,
    /// Ids of message queues owned by this task.
    pub message_queue_ids: Vec<u64>,
    /// Total ticks this task has been scheduled for.
    pub tick_count: u64,
}

impl Task {
    pub fn new(id: TaskId, name: String, entry: fn(), stack_size: usize) -> Self {
        Self {
            id,
            cpu_id: 0,
            name,
            state: TaskState::Created,
            entry,
            argc: 0,
            argv: 0,
            stack: vec![0u8; stack_size].into_boxed_slice(),
            registers: SavedRegisters::default(),
            fx_state: Box::new(FxState::new()),
            page_table_root: 0,
            last_tick: 0,
            wake_tick: 0,
            interruptible: false,
            message_waiting: false,
            interrupt_received: false,
            input: Arc::new(Mutex::new(Vec::new())),
            output: Arc::new(Mutex::new(Vec::new())),
            error: Arc::new(Mutex::new(Vec::new())),
            vmcs_physical_address: None,
            vm_id: None,
            message_queue_ids: Vec::new(),
            tick_count: 0,
        }
    }

    /// Top of the kernel stack (stacks grow down).
    pub fn stack_top(&self) -> u64 {
        self.stack.as_ptr() as u64 + self.stack.len() as u64
    }

    pub fn stack_bottom(&self) -> u64 {
        self.stack.as_ptr() as u64
    }

    /// Is this task parked in any waiting state?
    pub fn is_waiting(&self) -> bool {
        matches!(
            self.state,
            TaskState::Sleeping
                | TaskState::WaitingMessage
                | TaskState::WaitingFuture
                | TaskState::WaitingInterrupt
        )
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::string::ToString;

    use super::*;

    fn noop() {}

    #[test]
    fn test_fx_state_alignment() {
        let fx = Box::new(FxState::new());
        assert_eq!(core::mem::size_of::<FxState>(), 512);
        assert_eq!((&*fx as *const FxState as usize) % 16, 0);
    }

    #[test]
    fn test_saved_registers_layout_frozen() {
        // Offsets are load-bearing for the context switch assembly.
        assert_eq!(core::mem::size_of::<SavedRegisters>(), 18 * 8);
        let regs = SavedRegisters::default();
        let base = &regs as *const SavedRegisters as usize;
        assert_eq!(&regs.rax as *const u64 as usize - base, 0);
        assert_eq!(&regs.rsp as *const u64 as usize - base, 15 * 8);
        assert_eq!(&regs.rflags as *const u64 as usize - base, 16 * 8);
        assert_eq!(&regs.rip as *const u64 as usize - base, 17 * 8);
    }

    #[test]
    fn test_stack_range() {
        let task = Task::new(7, "t".to_string(), noop, 2048);
        assert_eq!(task.stack_top() - task.stack_bottom(), 2048);
        assert_eq!(task.state, TaskState::Created);
        assert!(!task.is_waiting());
    }
}
