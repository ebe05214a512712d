//! Write-once global state
//!
//! `static mut` free: a cell that is initialized exactly once during boot and
//! read everywhere after. Process-wide singletons (scheduler, VM list, boot
//! handoff) live behind [`GlobalState`] with the init order documented at the
//! call sites in `lib.rs`.

use core::sync::atomic::{AtomicPtr, Ordering};

use alloc::boxed::Box;

/// A cell that can be written to only once.
pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Get the value if initialized.
    pub fn get(&self) -> Option<&'static T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: A non-null pointer was stored by `set` from
            // `Box::into_raw`, and the allocation is never freed. The Acquire
            // load pairs with the Release store so the value is fully built.
            Some(unsafe { &*ptr })
        }
    }

    /// Initialize the cell. Returns the value back if already initialized.
    pub fn set(&self, value: T) -> Result<(), T> {
        let ptr = Box::into_raw(Box::new(value));
        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: The exchange failed, so nobody else saw `ptr`; we
                // reclaim our own fresh allocation.
                let boxed = unsafe { Box::from_raw(ptr) };
                Err(*boxed)
            }
        }
    }

    /// Get, initializing through `f` on first use.
    pub fn get_or_init<F>(&self, f: F) -> &'static T
    where
        F: FnOnce() -> T,
    {
        if let Some(val) = self.get() {
            return val;
        }
        let _ = self.set(f());
        self.get().expect("once lock empty after set")
    }
}

// SAFETY: Access to the inner value is gated by the atomic pointer; the value
// itself must be shareable.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}
unsafe impl<T: Send> Send for OnceLock<T> {}

/// A boot-initialized singleton: `init` once, `get` everywhere.
pub struct GlobalState<T> {
    cell: OnceLock<T>,
}

impl<T: 'static> GlobalState<T> {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// Install the value. Later calls are rejected with the value returned.
    pub fn init(&self, value: T) -> Result<(), T> {
        self.cell.set(value)
    }

    /// Borrow the singleton; panics if boot never installed it.
    pub fn get(&self) -> &'static T {
        self.cell.get().expect("global state used before init")
    }

    pub fn try_get(&self) -> Option<&'static T> {
        self.cell.get()
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<T: 'static> Default for GlobalState<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_set_once() {
        let cell: OnceLock<u32> = OnceLock::new();
        assert!(cell.get().is_none());
        assert!(cell.set(1).is_ok());
        assert_eq!(cell.set(2), Err(2));
        assert_eq!(cell.get(), Some(&1));
    }

    #[test]
    fn test_get_or_init_runs_once() {
        let cell: OnceLock<u32> = OnceLock::new();
        assert_eq!(*cell.get_or_init(|| 5), 5);
        assert_eq!(*cell.get_or_init(|| 6), 5);
    }

    #[test]
    fn test_global_state() {
        let state: GlobalState<&str> = GlobalState::new();
        assert!(!state.is_initialized());
        assert!(state.try_get().is_none());
        state.init("ready").unwrap();
        assert_eq!(*state.get(), "ready");
        assert!(state.init("again").is_err());
    }
}
