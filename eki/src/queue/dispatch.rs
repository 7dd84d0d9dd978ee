use crate::context;
use crate::queue::{Priority, QueueId, QueueKind};
use crate::runtime::{self, Job, Latch};
use crate::utils::panic_message;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Scheduling state behind every queue, system and custom alike.
pub(crate) struct QueueInner {
    pub(crate) id: QueueId,
    pub(crate) label: String,
    pub(crate) kind: QueueKind,
    pub(crate) priority: Priority,
    pub(crate) system: bool,
    state: Mutex<DispatchState>,
}

#[derive(Default)]
struct DispatchState {
    pending: VecDeque<Item>,

    /// Items started and not yet finished, async and sync alike.
    running: usize,

    /// A barrier is running, nothing else may start.
    barrier_running: bool,

    suspend_count: usize,
}

struct Item {
    work: Work,
    barrier: bool,
}

enum Work {
    /// Runs on a pool worker.
    Async(Job),

    /// Runs on the thread blocked in `submit_and_wait`, which is released
    /// through the latch once the queue grants it a slot.
    Sync(Arc<Latch>),
}

impl QueueInner {
    pub(crate) fn new(label: String, kind: QueueKind, priority: Priority, system: bool) -> Self {
        let id = QueueId::next();
        tracing::debug!(?id, %label, ?kind, ?priority, "queue created");

        Self {
            id,
            label,
            kind,
            priority,
            system,
            state: Mutex::new(DispatchState::default()),
        }
    }

    pub(crate) fn enqueue(self: &Arc<Self>, job: Job, barrier: bool) {
        self.push(Work::Async(job), barrier);
    }

    /// Queues a slot for work run by the caller and returns the latch set
    /// once the slot is granted. The caller must call `finish` afterwards.
    pub(crate) fn enqueue_sync(self: &Arc<Self>, barrier: bool) -> Arc<Latch> {
        let granted = Arc::new(Latch::new());
        self.push(Work::Sync(Arc::clone(&granted)), barrier);
        granted
    }

    fn push(self: &Arc<Self>, work: Work, barrier: bool) {
        let mut state = self.state.lock();
        state.pending.push_back(Item { work, barrier });
        self.drain(&mut state);
    }

    /// Starts every pending item the queue discipline allows right now.
    fn drain(self: &Arc<Self>, state: &mut DispatchState) {
        while state.suspend_count == 0 && !state.barrier_running {
            let Some(front) = state.pending.front() else {
                break;
            };

            let can_start = match self.kind {
                QueueKind::Serial => state.running == 0,
                QueueKind::Concurrent => !front.barrier || state.running == 0,
            };
            if !can_start {
                break;
            }

            let Some(item) = state.pending.pop_front() else {
                break;
            };
            let barrier = item.barrier && self.kind == QueueKind::Concurrent;

            state.running += 1;
            state.barrier_running = barrier;

            match item.work {
                Work::Async(job) => {
                    let queue = Arc::clone(self);
                    runtime::handle()
                        .spawn_job(self.priority, Box::new(move || queue.run(job, barrier)));
                }
                Work::Sync(granted) => granted.set(),
            }
        }
    }

    fn run(self: Arc<Self>, job: Job, barrier: bool) {
        {
            let _scope = context::enter_queue(self.id);
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                tracing::error!(
                    queue = %self.label,
                    panic = panic_message(&*payload),
                    "work panicked"
                );
            }
        }

        self.finish(barrier);
    }

    /// Releases the slot of a finished item and starts what it was holding
    /// back.
    pub(crate) fn finish(self: &Arc<Self>, barrier: bool) {
        let mut state = self.state.lock();
        debug_assert!(state.running > 0, "finish without a running item");
        state.running -= 1;
        if barrier && self.kind == QueueKind::Concurrent {
            state.barrier_running = false;
        }
        self.drain(&mut state);
    }

    pub(crate) fn suspend(&self) {
        self.state.lock().suspend_count += 1;
    }

    /// Returns `false` if the queue was not suspended.
    pub(crate) fn resume(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock();
        if state.suspend_count == 0 {
            return false;
        }

        state.suspend_count -= 1;
        self.drain(&mut state);
        true
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.state.lock().suspend_count > 0
    }
}

impl fmt::Debug for QueueInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueInner")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}
