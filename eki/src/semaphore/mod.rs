//! Counting semaphore, and the single-permit `Mutex` built on it.

use crate::runtime::block_in_place;
use crate::utils::ScopeGuard;
use parking_lot::Condvar;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

mod mutex;
pub use mutex::{Locked, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreKind {
    /// No permit: every `wait` blocks until someone signals.
    Barrier,

    /// A single permit.
    Binary,

    /// A pool of `n` permits.
    Counting(usize),
}

impl SemaphoreKind {
    pub fn permits(self) -> usize {
        match self {
            SemaphoreKind::Barrier => 0,
            SemaphoreKind::Binary => 1,
            SemaphoreKind::Counting(n) => n,
        }
    }
}

/// Permit counter. Nothing ties a permit to whoever acquired it: pairing
/// `wait` with `signal` is up to the caller, or to `perform`.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

struct SemaphoreInner {
    permits: parking_lot::Mutex<Permits>,
    available: Condvar,
}

struct Permits {
    count: usize,

    /// Threads blocked in `wait`.
    waiters: usize,
}

impl Semaphore {
    pub fn new(kind: SemaphoreKind) -> Self {
        Self::with_permits(kind.permits())
    }

    pub fn with_permits(permits: usize) -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                permits: parking_lot::Mutex::new(Permits {
                    count: permits,
                    waiters: 0,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Permits that can be taken without blocking.
    pub fn available(&self) -> usize {
        self.inner.permits.lock().count
    }

    /// Takes a permit, blocking while none is available.
    pub fn wait(&self) {
        self.acquire(None);
    }

    /// Returns `false` if no permit became available within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.acquire(Instant::now().checked_add(timeout))
    }

    pub fn wait_deadline(&self, deadline: Instant) -> bool {
        self.acquire(Some(deadline))
    }

    fn acquire(&self, deadline: Option<Instant>) -> bool {
        {
            let mut permits = self.inner.permits.lock();
            if permits.count > 0 {
                permits.count -= 1;
                return true;
            }
        }

        block_in_place(|| {
            let mut permits = self.inner.permits.lock();
            permits.waiters += 1;

            let acquired = loop {
                if permits.count > 0 {
                    permits.count -= 1;
                    break true;
                }

                match deadline {
                    Some(deadline) => {
                        if self.inner.available.wait_until(&mut permits, deadline).timed_out() {
                            // A signal may land right at the deadline.
                            let acquired = permits.count > 0;
                            if acquired {
                                permits.count -= 1;
                            }
                            break acquired;
                        }
                    }
                    None => self.inner.available.wait(&mut permits),
                }
            };

            permits.waiters -= 1;
            acquired
        })
    }

    /// Releases a permit. Returns `true` if a blocked waiter was woken.
    pub fn signal(&self) -> bool {
        let mut permits = self.inner.permits.lock();
        permits.count += 1;

        if permits.waiters > 0 {
            self.inner.available.notify_one();
            true
        } else {
            false
        }
    }

    /// Runs `work` holding a permit. The permit is released on every exit
    /// path, unwinding included.
    pub fn perform<F, R>(&self, work: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.wait();
        let _signal = ScopeGuard::new(|| {
            self.signal();
        });
        work()
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let permits = self.inner.permits.lock();
        f.debug_struct("Semaphore")
            .field("available", &permits.count)
            .field("waiters", &permits.waiters)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::wait_until;
    use rstest::rstest;
    use static_assertions::assert_impl_all;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    assert_impl_all!(Semaphore: Send, Sync, Clone);

    #[rstest]
    #[case::barrier(SemaphoreKind::Barrier, 0)]
    #[case::binary(SemaphoreKind::Binary, 1)]
    #[case::counting(SemaphoreKind::Counting(5), 5)]
    fn test_kind_sets_initial_permits(#[case] kind: SemaphoreKind, #[case] expected: usize) {
        assert_eq!(Semaphore::new(kind).available(), expected);
    }

    #[rstest]
    #[case::one(1)]
    #[case::three(3)]
    fn test_at_most_n_concurrent_performs(#[case] permits: usize) {
        let semaphore = Semaphore::new(SemaphoreKind::Counting(permits));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles = (0..8)
            .map(|_| {
                let semaphore = semaphore.clone();
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    semaphore.perform(|| {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(10));
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), permits);
        assert_eq!(semaphore.available(), permits);
    }

    #[test]
    fn test_extra_waiter_blocks_until_signal() {
        let semaphore = Semaphore::new(SemaphoreKind::Counting(2));
        semaphore.wait();
        semaphore.wait();

        let third = {
            let semaphore = semaphore.clone();
            thread::spawn(move || semaphore.wait())
        };

        assert!(wait_until(|| semaphore.inner.permits.lock().waiters == 1));
        assert!(!third.is_finished());

        assert!(semaphore.signal());
        third.join().unwrap();
        assert_eq!(semaphore.available(), 0);
    }

    #[test]
    fn test_wait_timeout_on_barrier() {
        let semaphore = Semaphore::new(SemaphoreKind::Barrier);

        assert!(!semaphore.wait_timeout(Duration::from_millis(10)));
        assert_eq!(semaphore.inner.permits.lock().waiters, 0);

        assert!(!semaphore.signal());
        assert!(semaphore.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_perform_releases_on_panic() {
        let semaphore = Semaphore::new(SemaphoreKind::Binary);

        let res = panic::catch_unwind(AssertUnwindSafe(|| {
            semaphore.perform(|| panic!("work failed"));
        }));

        assert!(res.is_err());
        assert_eq!(semaphore.available(), 1);
    }
}
