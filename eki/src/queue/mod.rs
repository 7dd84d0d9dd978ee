//! Execution queues.
//!
//! A [`Queue`] owns no threads. It only decides when submitted work may start
//! and hands it to the runtime's worker pool: one item at a time in FIFO
//! order for a serial queue, as many as the pool allows for a concurrent one,
//! except around barriers.

use crate::context;
use crate::executor::{BarrierExecutor, BarrierSyncExecutor, SyncExecutor};
use crate::group::Group;
use crate::runtime::{self, Job, Target, block_in_place, job};
use crate::utils::ScopeGuard;
use std::fmt;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

mod dispatch;
pub(crate) use dispatch::QueueInner;

mod id;
pub(crate) use id::QueueId;

mod system;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// At most one item runs at a time, in submission order.
    Serial,

    /// Items may run in parallel, in no particular order.
    Concurrent,
}

/// Priority class a queue's work is scheduled at on the worker pool.
/// Workers take work from higher classes first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    UserInteractive,
    UserInitiated,
    #[default]
    Default,
    Utility,
    Background,
}

impl Priority {
    pub(crate) const COUNT: usize = 5;

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

/// An execution context work is submitted to.
///
/// The named variants are the process-wide system queues: `Main` is serial,
/// the others are concurrent and run at the priority class they are named
/// after. `Custom` holds a queue created with [`Queue::new`]; it stays alive
/// while any handle or pending work references it.
#[derive(Debug, Clone)]
pub enum Queue {
    Main,
    UserInteractive,
    UserInitiated,
    Default,
    Utility,
    Background,
    Custom(QueueHandle),
}

/// Reference-counted handle to a custom queue.
#[derive(Debug, Clone)]
pub struct QueueHandle(Arc<QueueInner>);

impl Queue {
    /// Creates a custom queue scheduled at the default priority. The label is
    /// only used for diagnostics.
    pub fn new(label: impl Into<String>, kind: QueueKind) -> Self {
        Self::with_priority(label, kind, Priority::Default)
    }

    pub fn with_priority(label: impl Into<String>, kind: QueueKind, priority: Priority) -> Self {
        let inner = QueueInner::new(label.into(), kind, priority, false);
        Queue::Custom(QueueHandle(Arc::new(inner)))
    }

    pub(crate) fn inner(&self) -> &Arc<QueueInner> {
        match self {
            Queue::Main => &system::get().main,
            Queue::UserInteractive => &system::get().user_interactive,
            Queue::UserInitiated => &system::get().user_initiated,
            Queue::Default => &system::get().default,
            Queue::Utility => &system::get().utility,
            Queue::Background => &system::get().background,
            Queue::Custom(handle) => &handle.0,
        }
    }

    pub fn label(&self) -> &str {
        &self.inner().label
    }

    pub fn kind(&self) -> QueueKind {
        self.inner().kind
    }

    pub fn priority(&self) -> Priority {
        self.inner().priority
    }

    pub fn is_system(&self) -> bool {
        !matches!(self, Queue::Custom(_))
    }

    /// Whether the calling thread is executing work of this queue, directly or
    /// nested inside a `submit_and_wait` issued from it.
    pub fn is_current(&self) -> bool {
        context::is_current(self.inner().id)
    }

    /// Submits `work` for asynchronous execution and returns immediately.
    pub fn submit<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_job(Box::new(work));
    }

    pub(crate) fn submit_job(&self, job: Job) {
        self.inner().enqueue(job, false);
    }

    /// Submits `work` and blocks until it ran, returning its result.
    ///
    /// `work` runs on the calling thread once the queue grants it a slot,
    /// with the same exclusion guarantees as asynchronous work. When called
    /// from the queue's own context, `work` runs inline right away: waiting
    /// for a slot we are holding would never end. A panic in `work`
    /// propagates to the caller.
    pub fn submit_and_wait<F, R>(&self, work: F) -> R
    where
        F: FnOnce() -> R,
    {
        if self.is_current() {
            return work();
        }

        self.run_in_slot(work, false)
    }

    /// On a concurrent queue, runs `work` once everything submitted before
    /// it finished, and holds back everything submitted after it until it
    /// returns. Ordinary submission on a serial queue.
    pub fn submit_barrier<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner().enqueue(Box::new(work), true);
    }

    /// Blocking form of [`submit_barrier`](Self::submit_barrier).
    ///
    /// # Panics
    ///
    /// Panics when called from the queue's own context, as a queue cannot
    /// exclude itself.
    #[track_caller]
    pub fn submit_barrier_and_wait<F, R>(&self, work: F) -> R
    where
        F: FnOnce() -> R,
    {
        assert!(
            !self.is_current(),
            "submit_barrier_and_wait called from the context of queue {:?}",
            self.label()
        );

        self.run_in_slot(work, true)
    }

    fn run_in_slot<F, R>(&self, work: F, barrier: bool) -> R
    where
        F: FnOnce() -> R,
    {
        let inner = self.inner();
        let granted = inner.enqueue_sync(barrier);
        block_in_place(|| granted.wait());

        let _release = ScopeGuard::new(|| inner.finish(barrier));
        let _scope = context::enter_queue(inner.id);
        work()
    }

    /// Calls `work` once for every index in `0..iterations` and returns when
    /// all calls completed. Indices are spread across the pool on a
    /// concurrent queue, and run in order on a serial queue or when called
    /// from the queue's own context.
    ///
    /// If any call panics, the panic propagates once every helper stopped.
    pub fn iterate<F>(&self, iterations: usize, work: F)
    where
        F: Fn(usize) + Sync,
    {
        if iterations == 0 {
            return;
        }

        if self.kind() == QueueKind::Serial || self.is_current() {
            return self.submit_and_wait(|| (0..iterations).for_each(&work));
        }

        let helpers = iterations.min(runtime::handle().parallelism());
        let next = AtomicUsize::new(0);
        let inner = self.inner();

        let results = (0..helpers)
            .map(|_| {
                let (helper, result) = job::scoped(|| {
                    loop {
                        let index = next.fetch_add(1, Ordering::Relaxed);
                        if index >= iterations {
                            break;
                        }
                        work(index);
                    }
                });

                // Safety: every result is waited on below, before `work` and
                // `next` go out of scope.
                inner.enqueue(unsafe { job::erase_lifetime(helper) }, false);
                result
            })
            .collect::<Vec<_>>();

        let outcomes = block_in_place(|| results.iter().map(|r| r.wait()).collect::<Vec<_>>());
        if let Some(payload) = outcomes.into_iter().find_map(Result::err) {
            panic::resume_unwind(payload);
        }
    }

    /// Submits `work` once `delay` elapsed, measured from now.
    pub fn after<F>(&self, delay: Duration, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let target = Target::Submit {
            queue: self.clone(),
            job: Box::new(work),
        };

        runtime::handle()
            .driver()
            .schedule(deadline, Duration::ZERO, target);
    }

    /// Submits every item of `works`, tracked by the returned group.
    pub fn submit_all<I>(&self, works: I) -> Group
    where
        I: IntoIterator,
        I::Item: FnOnce() + Send + 'static,
    {
        let group = Group::with_default_queue(self.clone());
        for work in works {
            group.submit(work);
        }
        group
    }

    /// Submits every item of `works` and blocks until all of them ran. From
    /// the queue's own context they run inline, in order.
    pub fn submit_all_and_wait<I>(&self, works: I)
    where
        I: IntoIterator,
        I::Item: FnOnce() + Send + 'static,
    {
        if self.is_current() {
            works.into_iter().for_each(|work| work());
            return;
        }

        self.submit_all(works).wait();
    }

    /// Stops the queue from starting pending work. Work already running is
    /// not affected. Suspensions nest: the queue restarts after as many
    /// `resume` calls.
    ///
    /// # Panics
    ///
    /// Panics on a system queue.
    #[track_caller]
    pub fn suspend(&self) {
        let inner = self.inner();
        assert!(!inner.system, "cannot suspend system queue {:?}", inner.label);
        inner.suspend();
    }

    /// # Panics
    ///
    /// Panics on a system queue, or when the queue is not suspended.
    #[track_caller]
    pub fn resume(&self) {
        let inner = self.inner();
        assert!(!inner.system, "cannot resume system queue {:?}", inner.label);

        let resumed = inner.resume();
        assert!(resumed, "queue {:?} resumed more times than suspended", inner.label);
    }

    pub fn is_suspended(&self) -> bool {
        self.inner().is_suspended()
    }

    /// Executor running work through [`submit_and_wait`](Self::submit_and_wait).
    pub fn sync_executor(&self) -> SyncExecutor {
        SyncExecutor::new(self.clone())
    }

    /// Executor running work through [`submit_barrier`](Self::submit_barrier).
    pub fn barrier_executor(&self) -> BarrierExecutor {
        BarrierExecutor::new(self.clone())
    }

    /// Executor running work through
    /// [`submit_barrier_and_wait`](Self::submit_barrier_and_wait).
    pub fn barrier_sync_executor(&self) -> BarrierSyncExecutor {
        BarrierSyncExecutor::new(self.clone())
    }
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        self.inner().id == other.inner().id
    }
}

impl Eq for Queue {}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
