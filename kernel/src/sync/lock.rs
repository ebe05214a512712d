//! Spin-with-yield kernel locks
//!
//! A lock is one 64-bit word taken with test-and-set. A waiter on CPU 0
//! yields so the scheduler-bearing CPU cannot deadlock against itself; other
//! CPUs pause. Re-acquisition by the same (task, cpu) owner is a no-op, and a
//! single release always unlocks. Releasing a lock that is not owned is a
//! defined no-op.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

/// When a CPU is panicking, every lock acquire becomes a pass-through so the
/// panic path can always print.
pub static KERNEL_PANIC_DISABLE_LOCKS: AtomicBool = AtomicBool::new(false);

type TaskIdGetter = fn() -> u64;
type CpuIdGetter = fn() -> u64;
type Yielder = fn();
type FutureWaker = fn(u64);

fn default_task_id() -> u64 {
    0
}

fn default_cpu_id() -> u64 {
    0
}

fn default_yield() {
    core::hint::spin_loop();
}

fn default_future_wake(_task_id: u64) {}

static TASK_ID_GETTER: AtomicPtr<()> = AtomicPtr::new(default_task_id as *mut ());
static CPU_ID_GETTER: AtomicPtr<()> = AtomicPtr::new(default_cpu_id as *mut ());
static YIELDER: AtomicPtr<()> = AtomicPtr::new(default_yield as *mut ());
static FUTURE_WAKER: AtomicPtr<()> = AtomicPtr::new(default_future_wake as *mut ());

/// Wire the lock layer to the scheduler. Called once when tasking comes up.
pub fn set_scheduler_hooks(
    task_id: TaskIdGetter,
    cpu_id: CpuIdGetter,
    yielder: Yielder,
    future_waker: FutureWaker,
) {
    TASK_ID_GETTER.store(task_id as *mut (), Ordering::Release);
    CPU_ID_GETTER.store(cpu_id as *mut (), Ordering::Release);
    YIELDER.store(yielder as *mut (), Ordering::Release);
    FUTURE_WAKER.store(future_waker as *mut (), Ordering::Release);
}

fn current_task_id() -> u64 {
    let f = TASK_ID_GETTER.load(Ordering::Acquire);
    // SAFETY: The slot only ever holds values produced by `fn as *mut ()`
    // casts of the matching signature.
    let f: TaskIdGetter = unsafe { core::mem::transmute(f) };
    f()
}

fn current_cpu_id() -> u64 {
    let f = CPU_ID_GETTER.load(Ordering::Acquire);
    // SAFETY: Same as `current_task_id`.
    let f: CpuIdGetter = unsafe { core::mem::transmute(f) };
    f()
}

fn yield_now() {
    let f = YIELDER.load(Ordering::Acquire);
    // SAFETY: Same as `current_task_id`.
    let f: Yielder = unsafe { core::mem::transmute(f) };
    f()
}

fn wake_future_waiter(task_id: u64) {
    let f = FUTURE_WAKER.load(Ordering::Acquire);
    // SAFETY: Same as `current_task_id`.
    let f: FutureWaker = unsafe { core::mem::transmute(f) };
    f(task_id)
}

/// Sentinel owner for "nobody".
const NO_OWNER: u64 = u64::MAX;

/// The kernel lock.
pub struct Lock {
    value: AtomicU64,
    owner_task: AtomicU64,
    owner_cpu: AtomicU64,
    for_future: bool,
    /// Task to wake on release of a future lock.
    waiter_task: AtomicU64,
}

impl Lock {
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
            owner_task: AtomicU64::new(NO_OWNER),
            owner_cpu: AtomicU64::new(NO_OWNER),
            for_future: false,
            waiter_task: AtomicU64::new(NO_OWNER),
        }
    }

    /// A future lock starts life held by `owner_task`; the consumer blocks in
    /// `acquire` until the producer releases.
    pub const fn new_future(owner_task: u64) -> Self {
        Self {
            value: AtomicU64::new(1),
            owner_task: AtomicU64::new(owner_task),
            owner_cpu: AtomicU64::new(0),
            for_future: true,
            waiter_task: AtomicU64::new(NO_OWNER),
        }
    }

    pub fn is_future_lock(&self) -> bool {
        self.for_future
    }

    /// Take the lock, spinning with yield on CPU 0 and pause elsewhere.
    pub fn acquire(&self) {
        if KERNEL_PANIC_DISABLE_LOCKS.load(Ordering::Relaxed) {
            return;
        }

        let task = current_task_id();
        let cpu = current_cpu_id();

        if self.value.load(Ordering::Acquire) != 0
            && self.owner_task.load(Ordering::Acquire) == task
            && self.owner_cpu.load(Ordering::Acquire) == cpu
        {
            // Recursive acquisition by the holder is a no-op.
            return;
        }

        if self.for_future {
            self.waiter_task.store(task, Ordering::Release);
        }

        while self
            .value
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if cpu == 0 {
                yield_now();
            } else {
                core::hint::spin_loop();
            }
            if KERNEL_PANIC_DISABLE_LOCKS.load(Ordering::Relaxed) {
                return;
            }
        }

        self.owner_task.store(task, Ordering::Release);
        self.owner_cpu.store(cpu, Ordering::Release);
    }

    /// Try to take the lock without blocking.
    pub fn try_acquire(&self) -> bool {
        let task = current_task_id();
        let cpu = current_cpu_id();

        if self.value.load(Ordering::Acquire) != 0
            && self.owner_task.load(Ordering::Acquire) == task
            && self.owner_cpu.load(Ordering::Acquire) == cpu
        {
            return true;
        }

        if self
            .value
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner_task.store(task, Ordering::Release);
            self.owner_cpu.store(cpu, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Release. Not-owned release is a no-op by contract.
    pub fn release(&self) {
        let task = current_task_id();
        let cpu = current_cpu_id();

        if self.value.load(Ordering::Acquire) == 0 {
            return;
        }
        if self.owner_task.load(Ordering::Acquire) != task
            || self.owner_cpu.load(Ordering::Acquire) != cpu
        {
            return;
        }

        self.owner_task.store(NO_OWNER, Ordering::Release);
        self.owner_cpu.store(NO_OWNER, Ordering::Release);
        self.value.store(0, Ordering::Release);

        if self.for_future {
            let waiter = self.waiter_task.swap(NO_OWNER, Ordering::AcqRel);
            if waiter != NO_OWNER {
                wake_future_waiter(waiter);
            }
        }
    }

    /// RAII acquire.
    pub fn guard(&self) -> LockGuard<'_> {
        self.acquire();
        LockGuard { lock: self }
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard returned by [`Lock::guard`]; releases on drop.
pub struct LockGuard<'a> {
    lock: &'a Lock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Hook set shared by every host test that exercises locks: one synthetic
/// task id per OS thread, CPU 0 everywhere, OS-level yield.
#[cfg(all(test, not(target_os = "none")))]
pub mod test_support {
    extern crate std;

    use std::sync::atomic::{AtomicU64 as StdAtomicU64, Ordering as StdOrdering};

    use super::set_scheduler_hooks;

    static NEXT_TEST_TASK: StdAtomicU64 = StdAtomicU64::new(1);

    std::thread_local! {
        static TEST_TASK_ID: u64 = NEXT_TEST_TASK.fetch_add(1, StdOrdering::Relaxed);
    }

    pub fn test_task_id() -> u64 {
        TEST_TASK_ID.with(|id| *id)
    }

    fn test_cpu_id() -> u64 {
        0
    }

    fn test_yield() {
        std::thread::yield_now();
    }

    fn no_future_wake(_task_id: u64) {}

    /// Idempotent; safe to call from any test in any order.
    pub fn install() {
        set_scheduler_hooks(test_task_id, test_cpu_id, test_yield, no_future_wake);
    }
}
