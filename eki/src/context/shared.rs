use crate::queue::Priority;
use crate::runtime::{Job, RuntimeConfig};
use crossbeam_deque::Injector;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

/// State shared by every worker of a runtime.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) cfg: RuntimeConfig,

    /// One injector per priority class, indexed by `Priority::index`.
    pub(crate) injectors: [Injector<Job>; Priority::COUNT],

    pub(crate) shutdown: AtomicBool,

    /// Workers currently alive, core and overflow alike.
    live_workers: AtomicUsize,

    /// Workers blocked in `submit_and_wait`, `Group::wait`, `Semaphore::wait`
    /// and friends.
    blocked_workers: AtomicUsize,

    /// LIFO collection of parked threads. We unpark in LIFO order as the
    /// latest parked thread is the one where CPU cache will be the hottest.
    parked_threads: Mutex<VecDeque<ParkedThread>>,
}

#[derive(Debug)]
struct ParkedThread {
    thread: Thread,
    unparked: Arc<AtomicBool>,
}

impl Shared {
    pub(crate) fn new(cfg: &RuntimeConfig) -> Self {
        Self {
            cfg: cfg.clone(),
            injectors: std::array::from_fn(|_| Injector::new()),
            shutdown: AtomicBool::new(false),
            live_workers: AtomicUsize::new(0),
            blocked_workers: AtomicUsize::new(0),
            parked_threads: Mutex::new(VecDeque::with_capacity(cfg.worker_threads)),
        }
    }

    /// Pushes a job on the injector of its priority class and wakes one
    /// parked worker.
    pub(crate) fn push(&self, priority: Priority, job: Job) {
        self.injectors[priority.index()].push(job);
        self.unpark_one_thread();
    }

    pub(crate) fn has_pending_jobs(&self) -> bool {
        self.injectors.iter().any(|injector| !injector.is_empty())
    }

    /// Parks the current thread until a job is pushed or `timeout` elapses.
    /// Returns `false` if the thread woke up because of the timeout.
    pub(crate) fn park_current_thread(&self, unparked: &Arc<AtomicBool>, timeout: Duration) -> bool {
        {
            let mut parked_threads = self.parked_threads.lock();

            // Check these signals *while holding the lock*: `push` enqueues
            // before it takes the lock to unpark, so either we see the job
            // here or the pusher sees us in `parked_threads`.
            if self.has_pending_jobs() || self.shutdown.load(Ordering::Acquire) {
                return true;
            }

            unparked.store(false, Ordering::Release);
            parked_threads.push_back(ParkedThread {
                thread: thread::current(),
                unparked: Arc::clone(unparked),
            });
        }

        tracing::trace!(thread = ?thread::current().name(), "worker parked");
        let deadline = Instant::now().checked_add(timeout);

        // Loop to account for spurious wakeups as per docs.
        while !unparked.load(Ordering::Acquire) {
            let Some(deadline) = deadline else {
                thread::park();
                continue;
            };

            let now = Instant::now();
            if now < deadline {
                thread::park_timeout(deadline - now);
                continue;
            }

            let mut parked_threads = self.parked_threads.lock();
            if unparked.load(Ordering::Acquire) {
                // Someone popped us between the timeout and the lock.
                return true;
            }

            let id = thread::current().id();
            parked_threads.retain(|parked| parked.thread.id() != id);
            return false;
        }

        true
    }

    pub(crate) fn unpark_one_thread(&self) -> bool {
        if let Some(parked) = self.parked_threads.lock().pop_back() {
            parked.unparked.store(true, Ordering::Release);
            parked.thread.unpark();
            true
        } else {
            false
        }
    }

    pub(crate) fn unpark_all_threads(&self) -> usize {
        let mut num_unparked = 0;
        let mut parked_threads = self.parked_threads.lock();

        while let Some(parked) = parked_threads.pop_back() {
            num_unparked += 1;
            parked.unparked.store(true, Ordering::Release);
            parked.thread.unpark();
        }

        num_unparked
    }

    #[cfg(test)]
    pub(crate) fn num_parked_threads(&self) -> usize {
        self.parked_threads.lock().len()
    }

    pub(crate) fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::Acquire)
    }

    /// Reserves a slot for a new worker, failing once `max_threads` workers
    /// are alive.
    pub(crate) fn try_reserve_worker(&self) -> bool {
        self.live_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.cfg.max_threads).then_some(live + 1)
            })
            .is_ok()
    }

    /// Gives back a slot reserved with `try_reserve_worker`, when the thread
    /// could not be spawned.
    pub(crate) fn release_worker(&self) {
        self.live_workers.fetch_sub(1, Ordering::AcqRel);
    }

    /// An idle worker may exit while more than `worker_threads` are alive,
    /// unless only blocked workers would remain to pick up new jobs.
    pub(crate) fn try_retire_worker(&self) -> bool {
        self.live_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                let blocked = self.blocked_workers.load(Ordering::Acquire);
                (live > self.cfg.worker_threads && live - 1 > blocked).then(|| live - 1)
            })
            .is_ok()
    }

    /// Records that a worker is about to block. Returns `true` when every live
    /// worker is now blocked, meaning queued work can only make progress on a
    /// new thread.
    pub(crate) fn enter_blocking(&self) -> bool {
        let blocked = self.blocked_workers.fetch_add(1, Ordering::AcqRel) + 1;
        blocked >= self.live_workers()
    }

    pub(crate) fn exit_blocking(&self) {
        self.blocked_workers.fetch_sub(1, Ordering::AcqRel);
    }
}
