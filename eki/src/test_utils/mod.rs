use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// Exports
pub(crate) mod spy;
pub(crate) use spy::{Call, Method, SpyExecutor};

/// Upper bound for anything a test waits on. Generous so slow CI machines
/// don't flake, while a hang still fails the test eventually.
pub(crate) const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Polls `cond` until it holds or `TEST_TIMEOUT` elapses.
#[track_caller]
pub(crate) fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TEST_TIMEOUT;

    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }

    true
}

/// Thread-safe log of events, used to assert on execution order.
#[derive(Debug)]
pub(crate) struct Recorder<T> {
    events: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
        }
    }
}

impl<T: Clone> Recorder<T> {
    pub(crate) fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn push(&self, event: T) {
        self.events.lock().push(event);
    }

    pub(crate) fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub(crate) fn events(&self) -> Vec<T> {
        self.events.lock().clone()
    }
}

/// Blocks waiters until `count_down` was called `count` times.
#[derive(Debug)]
pub(crate) struct CountLatch {
    remaining: Mutex<usize>,
    cond: Condvar,
}

impl CountLatch {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        debug_assert!(*remaining > 0, "count_down called too many times");
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.cond.notify_all();
        }
    }

    pub(crate) fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.cond.wait(&mut remaining);
        }
    }
}
