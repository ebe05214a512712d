//! The task scheduler
//!
//! One shared task map and ready queue behind the tasking lock. Wake-up
//! signallers (timer ISR, message push, future release, cross-CPU interrupt
//! senders) only flip state under that lock; a waiting task never holds it.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::task::{Task, TaskState};
use super::{TaskId, KERNEL_TASK_ID, MAX_CPUS, MAX_TICK_COUNT};
use crate::error::{KernelError, KernelResult};

struct SchedulerInner {
    tasks: BTreeMap<TaskId, Task>,
    ready: VecDeque<TaskId>,
    current: [Option<TaskId>; MAX_CPUS],
    cleaner: Vec<TaskId>,
    next_id: TaskId,
}

impl SchedulerInner {
    const fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            ready: VecDeque::new(),
            current: [None; MAX_CPUS],
            cleaner: Vec::new(),
            next_id: KERNEL_TASK_ID,
        }
    }
}

/// The scheduler object. The kernel uses the [`SCHEDULER`] singleton; tests
/// instantiate their own.
pub struct Scheduler {
    inner: Mutex<SchedulerInner>,
    /// Last tick the timer path reported; yields stamp tasks with it.
    epoch: AtomicU64,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(SchedulerInner::new()),
            epoch: AtomicU64::new(0),
        }
    }

    /// Install the kernel task (task 0 of the system) as Running on `cpu`.
    pub fn adopt_boot_task(&self, cpu: u64, name: &str, entry: fn()) -> TaskId {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let id = inner.next_id;
        inner.next_id += 1;
        let mut task = Task::new(id, String::from(name), entry, 0);
        task.cpu_id = cpu;
        task.state = TaskState::Running;
        inner.tasks.insert(id, task);
        inner.current[cpu as usize % MAX_CPUS] = Some(id);
        id
    }

    /// Create a task and queue it runnable.
    pub fn create(
        &self,
        name: &str,
        entry: fn(),
        stack_size: usize,
        argc: u64,
        argv: u64,
    ) -> KernelResult<TaskId> {
        if stack_size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let id = inner.next_id;
        inner.next_id += 1;

        let mut task = Task::new(id, String::from(name), entry, stack_size);
        task.argc = argc;
        task.argv = argv;
        task.state = TaskState::Runnable;
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        crate::arch::x86_64::context::prepare_first_run(&mut task);
        inner.tasks.insert(id, task);
        inner.ready.push_back(id);
        Ok(id)
    }

    /// Task currently on `cpu`, if any.
    pub fn current_on(&self, cpu: u64) -> Option<TaskId> {
        self.inner.lock().current[cpu as usize % MAX_CPUS]
    }

    /// Cooperative yield from the task on `cpu`.
    pub fn yield_on(&self, cpu: u64) {
        self.switch_on(cpu, self.epoch.load(Ordering::Relaxed));
    }

    /// Timer tick: wake due sleepers, then preempt `cpu` if its task has held
    /// the CPU for `MAX_TICK_COUNT` ticks.
    pub fn timer_tick(&self, cpu: u64, now: u64) {
        self.epoch.store(now, Ordering::Relaxed);
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let due: Vec<TaskId> = inner
                .tasks
                .iter()
                .filter(|(_, t)| t.state == TaskState::Sleeping && now >= t.wake_tick)
                .map(|(&id, _)| id)
                .collect();
            for id in due {
                if let Some(t) = inner.tasks.get_mut(&id) {
                    t.state = TaskState::Runnable;
                    inner.ready.push_back(id);
                }
            }

            let current = inner.current[cpu as usize % MAX_CPUS];
            if let Some(t) = current.and_then(|id| inner.tasks.get_mut(&id)) {
                t.tick_count += 1;
                if now.saturating_sub(t.last_tick) < MAX_TICK_COUNT {
                    return;
                }
            }
        }
        self.switch_on(cpu, now);
    }

    /// Put the task on `cpu` to sleep until the epoch reaches `wake_tick`.
    pub fn sleep_until(&self, cpu: u64, wake_tick: u64) {
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let current = inner.current[cpu as usize % MAX_CPUS];
            if let Some(t) = current.and_then(|id| inner.tasks.get_mut(&id)) {
                t.wake_tick = wake_tick;
                t.state = TaskState::Sleeping;
            }
        }
        self.switch_on(cpu, self.epoch.load(Ordering::Relaxed));
    }

    /// Terminate the task on `cpu`; it moves to the cleaner queue and is
    /// reaped by the kernel task.
    pub fn end_task(&self, cpu: u64) {
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if let Some(id) = inner.current[cpu as usize % MAX_CPUS] {
                if let Some(t) = inner.tasks.get_mut(&id) {
                    t.state = TaskState::Zombie;
                }
                inner.cleaner.push(id);
                inner.current[cpu as usize % MAX_CPUS] = None;
            }
        }
        self.switch_on(cpu, self.epoch.load(Ordering::Relaxed));
    }

    /// Reap zombies. Run by the kernel task when it gets the CPU.
    pub fn cleanup(&self) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut reaped = 0;
        for id in inner.cleaner.drain(..) {
            if inner.tasks.remove(&id).is_some() {
                reaped += 1;
            }
        }
        reaped
    }

    /// Mark the task on `cpu` interruptible (it may park in WaitingInterrupt).
    pub fn set_interruptible(&self, cpu: u64) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let current = inner.current[cpu as usize % MAX_CPUS];
        if let Some(t) = current.and_then(|id| inner.tasks.get_mut(&id)) {
            t.interruptible = true;
        }
    }

    /// Park the task on `cpu` until one of its message queues fills.
    pub fn wait_for_message(&self, cpu: u64) {
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let current = inner.current[cpu as usize % MAX_CPUS];
            if let Some(t) = current.and_then(|id| inner.tasks.get_mut(&id)) {
                t.message_waiting = true;
                t.state = TaskState::WaitingMessage;
            }
        }
        self.switch_on(cpu, self.epoch.load(Ordering::Relaxed));
    }

    /// A message arrived for `task`; clear the flag and wake it.
    pub fn message_delivered(&self, task: TaskId) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(t) = inner.tasks.get_mut(&task) {
            t.message_waiting = false;
            if t.state == TaskState::WaitingMessage {
                t.state = TaskState::Runnable;
                inner.ready.push_back(task);
            }
        }
    }

    /// Park the task on `cpu` until an interrupt is flagged for it.
    pub fn wait_for_interrupt(&self, cpu: u64) {
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let current = inner.current[cpu as usize % MAX_CPUS];
            if let Some(t) = current.and_then(|id| inner.tasks.get_mut(&id)) {
                if t.interrupt_received {
                    // Already delivered; consume and continue.
                    t.interrupt_received = false;
                    return;
                }
                t.state = TaskState::WaitingInterrupt;
            }
        }
        self.switch_on(cpu, self.epoch.load(Ordering::Relaxed));
    }

    /// Flag an interrupt for `task`, waking it and kicking its CPU if the
    /// waiter sits on a different one.
    pub fn set_interrupt_received(&self, task: TaskId) {
        let kick_cpu = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let Some(t) = inner.tasks.get_mut(&task) else {
                return;
            };
            t.interrupt_received = true;
            let cpu = t.cpu_id;
            if t.state == TaskState::WaitingInterrupt {
                t.interrupt_received = false;
                t.state = TaskState::Runnable;
                inner.ready.push_back(task);
            }
            cpu
        };
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        if kick_cpu != crate::arch::x86_64::current_cpu_id() {
            crate::arch::x86_64::send_scheduler_ipi(kick_cpu);
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        let _ = kick_cpu;
    }

    /// Toggle the future-wait state of `task`: a waiting task wakes, a
    /// running one parks the next time it is switched away.
    pub fn toggle_wait_for_future(&self, task: TaskId) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(t) = inner.tasks.get_mut(&task) {
            if t.state == TaskState::WaitingFuture {
                t.state = TaskState::Runnable;
                inner.ready.push_back(task);
            } else if t.state == TaskState::Running || t.state == TaskState::Runnable {
                t.state = TaskState::WaitingFuture;
            }
        }
    }

    /// Log every task through the tasking channel.
    pub fn dump(&self) {
        let guard = self.inner.lock();
        for (id, t) in guard.tasks.iter() {
            crate::klog!(
                Tasking,
                Info,
                "task {:#x} '{}' {:?} cpu {} ticks {}",
                id,
                t.name,
                t.state,
                t.cpu_id,
                t.tick_count
            );
        }
    }

    pub fn task_count(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Run a closure against a task under the scheduler lock.
    pub fn with_task<R>(&self, task: TaskId, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        let mut guard = self.inner.lock();
        guard.tasks.get_mut(&task).map(f)
    }

    /// The switch: requeue the outgoing task if it is still Running, pick the
    /// next Runnable, and hand over the CPU.
    fn switch_on(&self, cpu: u64, now: u64) {
        let cpu_slot = cpu as usize % MAX_CPUS;
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        let mut prev_ptr: Option<*mut Task> = None;
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        let mut next_ptr: Option<*mut Task> = None;

        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            let outgoing = inner.current[cpu_slot];
            if let Some(prev_id) = outgoing {
                if let Some(prev) = inner.tasks.get_mut(&prev_id) {
                    if prev.state == TaskState::Running {
                        prev.state = TaskState::Runnable;
                        inner.ready.push_back(prev_id);
                    }
                    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
                    {
                        prev_ptr = Some(prev as *mut Task);
                    }
                }
            }

            let next_id = loop {
                match inner.ready.pop_front() {
                    Some(id) => {
                        if inner.tasks.get(&id).map(|t| t.state) == Some(TaskState::Runnable) {
                            break Some(id);
                        }
                        // Stale entry for a task that moved on; skip it.
                    }
                    None => break None,
                }
            };

            match next_id {
                Some(id) => {
                    if let Some(next) = inner.tasks.get_mut(&id) {
                        next.state = TaskState::Running;
                        next.cpu_id = cpu;
                        next.last_tick = now;
                        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
                        {
                            next_ptr = Some(next as *mut Task);
                        }
                    }
                    inner.current[cpu_slot] = Some(id);
                }
                None => {
                    // Nothing else runnable: the outgoing task keeps the CPU
                    // unless it parked or died.
                    let keep = outgoing.and_then(|prev_id| {
                        let t = inner.tasks.get_mut(&prev_id)?;
                        if t.state == TaskState::Runnable {
                            t.state = TaskState::Running;
                            t.last_tick = now;
                            Some(prev_id)
                        } else {
                            None
                        }
                    });
                    if let Some(prev_id) = keep {
                        inner.ready.retain(|&id| id != prev_id);
                    }
                    inner.current[cpu_slot] = keep;
                }
            }
        }

        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        if let (Some(prev), Some(next)) = (prev_ptr, next_ptr) {
            if prev != next {
                // SAFETY: Both pointers were taken from the task map under
                // the lock; tasks are only removed by cleanup(), which the
                // kernel task runs while neither of these is mid-switch.
                unsafe { crate::arch::x86_64::context::switch_context(prev, next) };
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Global scheduler instance
pub static SCHEDULER: Scheduler = Scheduler::new();

/// Hook targets handed to the lock layer at boot.
fn hook_current_task() -> u64 {
    SCHEDULER
        .current_on(crate::arch::x86_64::current_cpu_id())
        .unwrap_or(0)
}

fn hook_current_cpu() -> u64 {
    crate::arch::x86_64::current_cpu_id()
}

fn hook_yield() {
    SCHEDULER.yield_on(crate::arch::x86_64::current_cpu_id());
}

fn hook_future_wake(task: u64) {
    SCHEDULER.toggle_wait_for_future(task);
}

/// Bring tasking up: adopt `kmain` as the boot task and wire the lock layer.
pub fn init_tasking(kmain: fn()) -> TaskId {
    let id = SCHEDULER.adopt_boot_task(0, "kmain", kmain);
    crate::sync::lock::set_scheduler_hooks(
        hook_current_task,
        hook_current_cpu,
        hook_yield,
        hook_future_wake,
    );
    crate::klog!(Tasking, Info, "tasking online, boot task {:#x}", id);
    id
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn noop() {}

    #[test]
    fn test_create_and_round_robin() {
        let sched = Scheduler::new();
        let boot = sched.adopt_boot_task(0, "kmain", noop);
        let a = sched.create("a", noop, 2048, 0, 0).unwrap();
        let b = sched.create("b", noop, 2048, 0, 0).unwrap();

        assert_eq!(sched.current_on(0), Some(boot));
        sched.yield_on(0);
        assert_eq!(sched.current_on(0), Some(a));
        sched.yield_on(0);
        assert_eq!(sched.current_on(0), Some(b));
        sched.yield_on(0);
        assert_eq!(sched.current_on(0), Some(boot));
    }

    #[test]
    fn test_preemption_respects_minimum_quantum() {
        let sched = Scheduler::new();
        let boot = sched.adopt_boot_task(0, "kmain", noop);
        let _a = sched.create("a", noop, 2048, 0, 0).unwrap();

        // Under MAX_TICK_COUNT ticks: no preemption.
        for now in 1..MAX_TICK_COUNT {
            sched.timer_tick(0, now);
            assert_eq!(sched.current_on(0), Some(boot));
        }
        // Crossing the boundary switches.
        sched.timer_tick(0, MAX_TICK_COUNT);
        assert_ne!(sched.current_on(0), Some(boot));
    }

    #[test]
    fn test_scheduler_fairness() {
        let sched = Scheduler::new();
        sched.adopt_boot_task(0, "kmain", noop);
        let ids = [
            sched.create("a", noop, 2048, 0, 0).unwrap(),
            sched.create("b", noop, 2048, 0, 0).unwrap(),
        ];

        // Drive 1000 ticks; whoever holds the CPU "prints" one byte per tick.
        for now in 1..=1000u64 {
            if let Some(cur) = sched.current_on(0) {
                sched.with_task(cur, |t| {
                    let c = t.name.as_bytes().first().copied().unwrap_or(b'?');
                    t.output.lock().push(c);
                });
            }
            sched.timer_tick(0, now);
        }

        for id in ids {
            let produced = sched
                .with_task(id, |t| t.output.lock().len())
                .unwrap_or(0);
            assert!(
                produced >= 100,
                "task {:#x} only produced {} bytes",
                id,
                produced
            );
        }
    }

    #[test]
    fn test_sleep_and_wake() {
        let sched = Scheduler::new();
        let boot = sched.adopt_boot_task(0, "kmain", noop);
        let a = sched.create("a", noop, 2048, 0, 0).unwrap();

        sched.yield_on(0);
        assert_eq!(sched.current_on(0), Some(a));
        sched.sleep_until(0, 50);
        assert_eq!(sched.current_on(0), Some(boot));

        sched.timer_tick(0, 10);
        assert_eq!(sched.with_task(a, |t| t.state), Some(TaskState::Sleeping));
        sched.timer_tick(0, 50);
        // Woken; it may already have been handed the CPU.
        let state = sched.with_task(a, |t| t.state).unwrap();
        assert!(matches!(state, TaskState::Runnable | TaskState::Running));
    }

    #[test]
    fn test_end_task_reaped_by_cleaner() {
        let sched = Scheduler::new();
        let boot = sched.adopt_boot_task(0, "kmain", noop);
        let a = sched.create("a", noop, 2048, 0, 0).unwrap();
        sched.yield_on(0);
        assert_eq!(sched.current_on(0), Some(a));
        sched.end_task(0);
        assert_eq!(sched.current_on(0), Some(boot));
        assert_eq!(sched.with_task(a, |t| t.state), Some(TaskState::Zombie));
        assert_eq!(sched.cleanup(), 1);
        assert!(sched.with_task(a, |_| ()).is_none());
    }

    #[test]
    fn test_message_wait_and_delivery() {
        let sched = Scheduler::new();
        let boot = sched.adopt_boot_task(0, "kmain", noop);
        let a = sched.create("a", noop, 2048, 0, 0).unwrap();
        sched.yield_on(0);
        sched.wait_for_message(0);
        assert_eq!(sched.current_on(0), Some(boot));
        assert_eq!(
            sched.with_task(a, |t| t.state),
            Some(TaskState::WaitingMessage)
        );
        sched.message_delivered(a);
        assert_eq!(sched.with_task(a, |t| t.state), Some(TaskState::Runnable));
        assert_eq!(sched.with_task(a, |t| t.message_waiting), Some(false));
    }

    #[test]
    fn test_interrupt_wait_and_cross_delivery() {
        let sched = Scheduler::new();
        sched.adopt_boot_task(0, "kmain", noop);
        let a = sched.create("a", noop, 2048, 0, 0).unwrap();
        sched.yield_on(0);
        sched.set_interruptible(0);
        sched.wait_for_interrupt(0);
        assert_eq!(
            sched.with_task(a, |t| t.state),
            Some(TaskState::WaitingInterrupt)
        );
        sched.set_interrupt_received(a);
        assert_eq!(sched.with_task(a, |t| t.state), Some(TaskState::Runnable));
        // Flag was consumed by the wake-up.
        assert_eq!(sched.with_task(a, |t| t.interrupt_received), Some(false));
    }

    #[test]
    fn test_future_toggle() {
        let sched = Scheduler::new();
        sched.adopt_boot_task(0, "kmain", noop);
        let a = sched.create("a", noop, 2048, 0, 0).unwrap();
        sched.toggle_wait_for_future(a);
        assert_eq!(
            sched.with_task(a, |t| t.state),
            Some(TaskState::WaitingFuture)
        );
        sched.toggle_wait_for_future(a);
        assert_eq!(sched.with_task(a, |t| t.state), Some(TaskState::Runnable));
    }
}
