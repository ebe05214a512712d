//! Synchronization primitives
//!
//! Spin-with-yield locks, counting semaphores, single-shot futures, and safe
//! global initialization. The lock layer reaches the scheduler only through
//! injected hooks so `sync` stays free of a hard `sched` dependency.

pub mod future;
pub mod lock;
pub mod once_lock;
pub mod semaphore;

pub use future::Future;
pub use lock::{Lock, LockGuard};
pub use once_lock::{GlobalState, OnceLock};
pub use semaphore::Semaphore;
