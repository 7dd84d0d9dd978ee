use crate::queue::Queue;
use crate::runtime::{Job, RuntimeError};
use crate::source::SourceInner;
use crate::utils::panic_message;
use anyhow::Result;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

const DRIVER_THREAD_NAME: &str = "eki-timer";

/// What to do once a deadline is reached.
pub(crate) enum Target {
    /// Deliver a tick to a timer. Stale generations are ignored by the
    /// source, which is how rescheduling and cancellation drop old entries.
    Source {
        source: Weak<SourceInner>,
        generation: u64,
    },

    /// One-shot submission, as done by `Queue::after`.
    Submit { queue: Queue, job: Job },
}

impl Target {
    fn fire(self) {
        match self {
            Target::Source { source, generation } => {
                if let Some(source) = source.upgrade() {
                    SourceInner::on_deadline(&source, generation);
                }
            }
            Target::Submit { queue, job } => queue.submit_job(job),
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Source { generation, .. } => f
                .debug_struct("Source")
                .field("generation", generation)
                .finish_non_exhaustive(),
            Target::Submit { queue, .. } => f
                .debug_struct("Submit")
                .field("queue", queue)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    /// Never fire before this instant.
    deadline: Instant,

    /// Must fire by this instant, `deadline + leeway`.
    latest: Instant,

    /// Tie-breaker preserving insertion order.
    seq: u64,

    target: Target,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.latest, self.seq).cmp(&(other.latest, other.seq))
    }
}

#[derive(Debug, Default)]
struct DriverState {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
    shutdown: bool,
}

impl DriverState {
    /// Removes every entry whose deadline has passed. Entries are woken for
    /// by their `latest` instant, so anything else already eligible rides
    /// along on the same wakeup.
    fn take_due(&mut self, now: Instant) -> Vec<Entry> {
        let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.heap)
            .into_iter()
            .map(|Reverse(entry)| entry)
            .partition(|entry| entry.deadline <= now);

        self.heap = pending.into_iter().map(Reverse).collect();
        due.sort_by_key(|entry| (entry.deadline, entry.seq));
        due
    }
}

/// Single timer thread shared by every source and delayed submission of a
/// runtime.
#[derive(Debug)]
pub(crate) struct Driver {
    state: Mutex<DriverState>,
    cond: Condvar,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Driver {
    pub(crate) fn start() -> Result<Arc<Self>> {
        let driver = Arc::new(Self {
            state: Mutex::new(DriverState::default()),
            cond: Condvar::new(),
            thread: Mutex::new(None),
        });

        let handle = {
            let driver = Arc::clone(&driver);
            thread::Builder::new()
                .name(DRIVER_THREAD_NAME.to_owned())
                .spawn(move || driver.run())
                .map_err(|source| RuntimeError::Spawn {
                    name: DRIVER_THREAD_NAME.to_owned(),
                    source,
                })?
        };

        *driver.thread.lock() = Some(handle);
        Ok(driver)
    }

    /// Fires `target` no earlier than `deadline` and, unless the system is
    /// overloaded, no later than `deadline + leeway`.
    pub(crate) fn schedule(&self, deadline: Instant, leeway: Duration, target: Target) {
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Reverse(Entry {
            deadline,
            latest: deadline.checked_add(leeway).unwrap_or(deadline),
            seq,
            target,
        }));

        self.cond.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            state.shutdown = true;
            state.heap.clear();
            self.cond.notify_all();
        }

        if let Some(handle) = self.thread.lock().take()
            && handle.join().is_err()
        {
            tracing::error!("timer thread panicked");
        }
    }

    fn run(&self) {
        tracing::debug!("timer driver started");
        let mut state = self.state.lock();

        loop {
            if state.shutdown {
                break;
            }

            let Some(next) = state.heap.peek().map(|Reverse(entry)| entry.latest) else {
                self.cond.wait(&mut state);
                continue;
            };

            let now = Instant::now();
            if now < next {
                self.cond.wait_until(&mut state, next);
                continue;
            }

            let due = state.take_due(now);
            tracing::trace!(count = due.len(), "timer deadlines reached");

            // Targets take source and queue locks, never call them with ours held.
            MutexGuard::unlocked(&mut state, || due.into_iter().for_each(fire));
        }

        tracing::debug!("timer driver stopped");
    }
}

fn fire(entry: Entry) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| entry.target.fire())) {
        tracing::error!(panic = panic_message(&*payload), "timer target panicked");
    }
}
