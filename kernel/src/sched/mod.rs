//! Cooperative-preemptive tasking
//!
//! Each CPU runs exactly one task at a time; runnable tasks wait in a shared
//! FIFO-ish ready queue. Preemption happens only on timer ticks that cross
//! the [`MAX_TICK_COUNT`] boundary, so every task is guaranteed at least one
//! full scheduling tick.

pub mod scheduler;
pub mod task;

pub use scheduler::{Scheduler, SCHEDULER};
pub use task::{Task, TaskState};

/// Stable task identifier.
pub type TaskId = u64;

/// Task 0 of the system: `kmain`, which also reaps zombies.
pub const KERNEL_TASK_ID: TaskId = 1;

/// A running task is preempted only after this many ticks.
pub const MAX_TICK_COUNT: u64 = 10;

/// Maximum CPUs tracked by the scheduler.
pub const MAX_CPUS: usize = 16;
