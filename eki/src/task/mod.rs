//! Schedulable units of work with linear continuations.

use crate::queue::Queue;
use crate::runtime::{Job, block_in_place};
use crate::utils::panic_message;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Work bound to a queue, run at most once.
///
/// A task that is cancelled before it starts never runs. Once started it
/// always runs to completion; cancelling it then only prevents its
/// continuations from running.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    queue: Queue,
    state: Mutex<TaskState>,
    settled: Condvar,
}

struct TaskState {
    phase: Phase,
    work: Option<Job>,
    cancelled: bool,

    /// Submitted to the queue, by `run_async`, `run_sync` or a predecessor.
    scheduled: bool,

    /// Waits for a predecessor, which schedules it on completion.
    gated: bool,

    continuations: SmallVec<[Task; 1]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Running,
    Finished,

    /// Cancelled before it started. Terminal, the work was dropped.
    Cancelled,
}

impl Task {
    pub fn new<F>(queue: Queue, work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            inner: Arc::new(TaskInner {
                queue,
                state: Mutex::new(TaskState {
                    phase: Phase::Pending,
                    work: Some(Box::new(work)),
                    cancelled: false,
                    scheduled: false,
                    gated: false,
                    continuations: SmallVec::new(),
                }),
                settled: Condvar::new(),
            }),
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.inner.queue
    }

    /// Submits the task to its queue. Does nothing if the task was already
    /// submitted, cancelled, or is waiting on a predecessor.
    pub fn run_async(&self) {
        if !self.claim() {
            return;
        }

        let task = self.clone();
        self.inner.queue.submit(move || {
            if let Err(payload) = task.execute() {
                tracing::error!(
                    queue = %task.inner.queue,
                    panic = panic_message(&*payload),
                    "task panicked"
                );
            }
        });
    }

    /// Runs the task on its queue and blocks until it finished. A panic in
    /// the work propagates to the caller once continuations are released.
    /// Same no-op conditions as `run_async`.
    pub fn run_sync(&self) {
        if !self.claim() {
            return;
        }

        if let Err(payload) = self.inner.queue.submit_and_wait(|| self.execute()) {
            panic::resume_unwind(payload);
        }
    }

    fn claim(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.phase != Phase::Pending || state.scheduled || state.gated {
            return false;
        }

        state.scheduled = true;
        true
    }

    fn execute(&self) -> thread::Result<()> {
        let work = {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Pending {
                return Ok(());
            }
            state.phase = Phase::Running;
            state.work.take()
        };

        let outcome = match work {
            Some(work) => panic::catch_unwind(AssertUnwindSafe(work)),
            None => Ok(()),
        };

        let (continuations, cancelled) = {
            let mut state = self.inner.state.lock();
            state.phase = Phase::Finished;
            self.inner.settled.notify_all();
            (mem::take(&mut state.continuations), state.cancelled)
        };

        for next in continuations {
            if cancelled {
                next.cancel();
            } else {
                next.release();
            }
        }

        outcome
    }

    /// Prevents the task from running if it has not started, and its
    /// continuations from ever running. No effect on a finished task.
    pub fn cancel(&self) {
        let (work, continuations) = {
            let mut state = self.inner.state.lock();
            match state.phase {
                Phase::Finished | Phase::Cancelled => return,
                Phase::Running => {
                    // Continuations are cancelled when the work returns.
                    state.cancelled = true;
                    return;
                }
                Phase::Pending => {
                    state.cancelled = true;
                    state.phase = Phase::Cancelled;
                    self.inner.settled.notify_all();
                    (state.work.take(), mem::take(&mut state.continuations))
                }
            }
        };

        // Dropped outside the lock, the closure may own anything.
        drop(work);

        for next in continuations {
            next.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    pub fn is_finished(&self) -> bool {
        self.inner.state.lock().phase == Phase::Finished
    }

    /// Runs `work` on this task's queue once this task finished, normally or
    /// by panicking. Returns the continuation.
    pub fn chain<F>(&self, work: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        self.chain_on(self.inner.queue.clone(), work)
    }

    pub fn chain_on<F>(&self, queue: Queue, work: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        self.chain_task(Task::new(queue, work))
    }

    /// Makes `next` a continuation of this task.
    ///
    /// # Panics
    ///
    /// Panics if `next` was already submitted or chained.
    #[track_caller]
    pub fn chain_task(&self, next: Task) -> Task {
        {
            let mut state = next.inner.state.lock();
            assert!(
                state.phase == Phase::Pending && !state.scheduled && !state.gated,
                "chained task was already submitted or chained"
            );
            state.gated = true;
        }

        let released = {
            let mut state = self.inner.state.lock();
            match state.phase {
                Phase::Pending | Phase::Running => {
                    state.continuations.push(next.clone());
                    None
                }
                Phase::Finished => Some(!state.cancelled),
                Phase::Cancelled => Some(false),
            }
        };

        match released {
            Some(true) => next.release(),
            Some(false) => next.cancel(),
            None => {}
        }

        next
    }

    /// Called by the predecessor once it finished.
    fn release(&self) {
        self.inner.state.lock().gated = false;
        self.run_async();
    }

    /// Blocks until the task finished or was cancelled before running.
    /// A task never submitted nor chained never settles.
    pub fn wait(&self) {
        block_in_place(|| {
            let mut state = self.inner.state.lock();
            while !state.is_settled() {
                self.inner.settled.wait(&mut state);
            }
        });
    }

    /// Returns `false` if the task did not settle within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };

        block_in_place(|| {
            let mut state = self.inner.state.lock();
            while !state.is_settled() {
                if self.inner.settled.wait_until(&mut state, deadline).timed_out() {
                    return state.is_settled();
                }
            }
            true
        })
    }
}

impl TaskState {
    fn is_settled(&self) -> bool {
        matches!(self.phase, Phase::Finished | Phase::Cancelled)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Task")
            .field("queue", &self.inner.queue)
            .field("phase", &state.phase)
            .field("cancelled", &state.cancelled)
            .field("continuations", &state.continuations.len())
            .finish()
    }
}
