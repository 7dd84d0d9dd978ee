//! Completion tracking across queues.

use crate::executor::{Executor, NotifyExecutor};
use crate::queue::Queue;
use crate::runtime::{Job, block_in_place};
use crate::utils::ScopeGuard;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counts work in flight and reports when the count drops to zero.
///
/// Work submitted through the group is counted from submission until it
/// returns, panics or is dropped without running. Unrelated asynchronous
/// work can be tracked with `enter`/`leave`.
#[derive(Clone)]
pub struct Group {
    inner: Arc<GroupInner>,
}

struct GroupInner {
    state: Mutex<GroupState>,
    zero: Condvar,
    default_queue: Queue,
}

#[derive(Default)]
struct GroupState {
    count: usize,
    notifications: SmallVec<[Notification; 2]>,
}

struct Notification {
    executor: Box<dyn Executor>,
    work: Job,
}

impl Group {
    /// Creates a group whose `submit` and `notify` use `Queue::Background`.
    pub fn new() -> Self {
        Self::with_default_queue(Queue::Background)
    }

    pub fn with_default_queue(queue: Queue) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                state: Mutex::new(GroupState::default()),
                zero: Condvar::new(),
                default_queue: queue,
            }),
        }
    }

    pub fn default_queue(&self) -> &Queue {
        &self.inner.default_queue
    }

    /// Work currently tracked.
    pub fn count(&self) -> usize {
        self.inner.state.lock().count
    }

    pub fn submit<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_via(&self.inner.default_queue, work);
    }

    pub fn submit_on<F>(&self, queue: &Queue, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_via(queue, work);
    }

    /// Tracks `work` handed to any executor.
    pub fn submit_via<E, F>(&self, executor: &E, work: F)
    where
        E: Executor + ?Sized,
        F: FnOnce() + Send + 'static,
    {
        self.enter();

        // Leaves once the job is done with, whether it ran to completion,
        // panicked or was dropped unrun.
        let group = self.clone();
        let leave = ScopeGuard::new(move || group.leave());

        executor.execute(Box::new(move || {
            let _leave = leave;
            work();
        }));
    }

    pub fn enter(&self) {
        self.inner.state.lock().count += 1;
    }

    /// # Panics
    ///
    /// Panics when called more times than `enter`.
    #[track_caller]
    pub fn leave(&self) {
        let notifications = {
            let mut state = self.inner.state.lock();
            assert!(state.count > 0, "Group::leave called without a matching enter");

            state.count -= 1;
            if state.count > 0 {
                return;
            }

            self.inner.zero.notify_all();
            std::mem::take(&mut state.notifications)
        };

        for Notification { executor, work } in notifications {
            executor.execute(work);
        }
    }

    /// Blocks until no work is tracked.
    pub fn wait(&self) {
        block_in_place(|| {
            let mut state = self.inner.state.lock();
            while state.count > 0 {
                self.inner.zero.wait(&mut state);
            }
        });
    }

    /// Blocks until no work is tracked or `timeout` elapsed. Returns `false`
    /// on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_deadline(deadline),
            None => {
                self.wait();
                true
            }
        }
    }

    pub fn wait_deadline(&self, deadline: Instant) -> bool {
        block_in_place(|| {
            let mut state = self.inner.state.lock();
            while state.count > 0 {
                if self.inner.zero.wait_until(&mut state, deadline).timed_out() {
                    return state.count == 0;
                }
            }
            true
        })
    }

    /// Submits `work` to the default queue the next time no work is tracked,
    /// or right away if none is. Never runs `work` inline.
    pub fn notify<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.notify_via(self.inner.default_queue.clone(), work);
    }

    pub fn notify_on<F>(&self, queue: &Queue, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.notify_via(queue.clone(), work);
    }

    /// Hands `work` to `executor` the next time no work is tracked.
    pub fn notify_via<E, F>(&self, executor: E, work: F)
    where
        E: Executor + 'static,
        F: FnOnce() + Send + 'static,
    {
        let work: Job = Box::new(work);
        {
            let mut state = self.inner.state.lock();
            if state.count > 0 {
                state.notifications.push(Notification {
                    executor: Box::new(executor),
                    work,
                });
                return;
            }
        }

        executor.execute(work);
    }

    /// Executor registering work as a notification of this group.
    pub fn notify_executor(&self) -> NotifyExecutor {
        NotifyExecutor::new(self.clone())
    }
}

impl Default for Group {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Group")
            .field("count", &state.count)
            .field("notifications", &state.notifications.len())
            .field("default_queue", &self.inner.default_queue)
            .finish()
    }
}
