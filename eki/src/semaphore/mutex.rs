use crate::semaphore::Semaphore;
use std::cell::UnsafeCell;
use std::fmt;
use std::time::Duration;

/// Single-permit semaphore.
///
/// Only the thread that locked it is expected to unlock it. This is a
/// convention and is not checked: unlocking from elsewhere releases the lock
/// all the same.
#[derive(Debug, Clone)]
pub struct Mutex {
    semaphore: Semaphore,
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            semaphore: Semaphore::with_permits(1),
        }
    }

    pub fn lock(&self) {
        self.semaphore.wait();
    }

    /// Returns `false` if the lock could not be taken within `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> bool {
        self.semaphore.wait_timeout(timeout)
    }

    pub fn unlock(&self) {
        self.semaphore.signal();
    }

    /// Runs `work` with the lock held, releasing it even if `work` panics.
    pub fn perform<F, R>(&self, work: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.semaphore.perform(work)
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

/// A value only reachable while holding its `Mutex`.
pub struct Locked<T> {
    value: UnsafeCell<T>,
    mutex: Mutex,
}

// Safety: `value` is only accessed through `access`, which holds `mutex` for
// the whole borrow, so at most one thread touches it at a time.
unsafe impl<T: Send> Sync for Locked<T> {}

impl<T> Locked<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
            mutex: Mutex::new(),
        }
    }

    /// Runs `f` with exclusive access to the value.
    pub fn access<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        self.mutex.perform(|| {
            // Safety: the mutex is held until `perform` returns, and the
            // borrow does not escape `f`.
            let value = unsafe { &mut *self.value.get() };
            f(value)
        })
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for Locked<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for Locked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locked").finish_non_exhaustive()
    }
}
