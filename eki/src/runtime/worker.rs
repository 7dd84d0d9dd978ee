use crate::context::{self, Shared};
use crate::runtime::Job;
use crate::runtime::ticker::{Ticker, TickerData, TickerEvents};
use crate::utils::panic_message;
use crossbeam_deque::{Injector, Steal};
use std::iter;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub(crate) struct Worker {
    shared: Arc<Shared>,

    /// Event loop ticker.
    ticker: Ticker,

    /// Determines how we run the event loop.
    policy: WorkerPolicy,

    /// Set by whoever pops us from the parked threads list.
    unparked: Arc<AtomicBool>,
}

impl Worker {
    pub(super) fn new(shared: Arc<Shared>) -> Self {
        let policy = WorkerPolicy {
            fairness_interval: shared.cfg.fairness_interval,
        };

        Self {
            shared,
            ticker: Ticker::new(),
            policy,
            unparked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Takes the next job from the injectors, highest priority class first,
    /// or lowest first when `lowest_first` is set.
    fn find_job(&self, lowest_first: bool) -> Option<Job> {
        let injectors = &self.shared.injectors;

        iter::repeat_with(|| {
            // The behavior of collect here is to return the first Success(T) so
            // we stop at the first non-empty priority class.
            if lowest_first {
                injectors.iter().rev().map(Injector::steal).collect::<Steal<Job>>()
            } else {
                injectors.iter().map(Injector::steal).collect::<Steal<Job>>()
            }
        })
        // Repeat a maximum of `max_steal_retries` otherwise return None.
        .take(self.shared.cfg.max_steal_retries)
        .find(|s| !s.is_retry())
        .and_then(|s| s.success())
    }

    pub(super) fn run(mut self) {
        context::init_worker_context(Arc::clone(&self.shared));
        tracing::debug!("worker started");

        loop {
            let events = self.ticker.tick(&*self.shared, &mut self.policy);

            if events.contains(TickerEvents::SHUTDOWN) {
                self.shared.release_worker();
                tracing::debug!("worker stopped");
                break;
            }

            if let Some(job) = self.find_job(events.contains(TickerEvents::LOWEST_PRIORITY_FIRST))
            {
                run_job(job);
                continue;
            }

            let keep_alive = self.shared.cfg.keep_alive;
            if !self.shared.park_current_thread(&self.unparked, keep_alive)
                && self.shared.try_retire_worker()
            {
                tracing::debug!(?keep_alive, "idle worker retired");
                break;
            }
        }
    }
}

/// Runs a job, keeping the worker alive if it panics.
fn run_job(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        tracing::error!(panic = panic_message(&*payload), "job panicked on worker");
    }
}

#[derive(Debug)]
struct WorkerPolicy {
    fairness_interval: u32,
}

impl TickerData for WorkerPolicy {
    type Context = Shared;

    fn update_and_check(&mut self, shared: &Shared, tick: u32) -> TickerEvents {
        let mut events = TickerEvents::empty();

        if shared.shutdown.load(Ordering::Acquire) {
            events |= TickerEvents::SHUTDOWN;
        }

        if tick.is_multiple_of(self.fairness_interval) {
            events |= TickerEvents::LOWEST_PRIORITY_FIRST;
        }

        events
    }
}
