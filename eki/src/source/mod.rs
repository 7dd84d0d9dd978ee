//! Event sources: timers and user-triggered data sources.
//!
//! Every source delivers events by submitting its handler to a queue. At most
//! one delivery per source is queued or running at a time; anything arriving
//! meanwhile is merged into the next event and read back through
//! [`Source::data`].
//!
//! Sources are created suspended. Suspensions are counted: a source runs once
//! it was resumed as many times as it was suspended, plus once for creation.
//! Cancellation is terminal and releases the handlers.

use crate::queue::Queue;
use crate::runtime::{self, Target};
use crate::utils::panic_message;
use parking_lot::Mutex;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

mod data;
pub use data::{DataSource, DataSourceKind};

mod errors;
pub use errors::SourceError;

mod timer;
pub use timer::{StartTime, Timer, TimerFlags};

type EventHandler = Arc<dyn Fn(&Source) + Send + Sync>;
type OnceHandler = Box<dyn FnOnce(&Source) + Send>;

/// Shared handle to a timer or data source, handed to its handlers.
///
/// Unlike [`Timer`] and [`DataSource`], dropping a `Source` does not cancel
/// anything.
#[derive(Clone)]
pub struct Source {
    inner: Arc<SourceInner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceKind {
    Timer,
    Data(DataSourceKind),
}

pub(crate) struct SourceInner {
    queue: Queue,
    kind: SourceKind,
    state: Mutex<SourceState>,

    /// Payload of the event being delivered.
    data: AtomicU64,
}

struct SourceState {
    suspend_count: usize,

    /// Resumed at least once. The start handler runs on activation.
    activated: bool,

    cancelled: bool,
    handler: Option<EventHandler>,
    start_handler: Option<OnceHandler>,
    cancel_handler: Option<OnceHandler>,

    /// Accumulated for the next event: tick count or merged data.
    pending: u64,

    /// A delivery or the start handler is queued or running.
    busy: bool,

    timer: Option<TimerState>,

    /// Bumped whenever driver entries must be ignored.
    generation: u64,
}

#[derive(Debug)]
struct TimerState {
    /// Next deadline, `None` once a one-shot timer fired.
    next: Option<Instant>,
    interval: Option<Duration>,
    leeway: Duration,

    /// An entry for `next` is registered with the driver.
    armed: bool,
}

impl TimerState {
    /// Moves `next` past `now` and returns how many deadlines were crossed.
    fn advance(&mut self, now: Instant) -> u64 {
        let Some(next) = self.next else {
            return 0;
        };
        if now < next {
            return 0;
        }

        let Some(interval) = self.interval else {
            self.next = None;
            return 1;
        };

        let missed = (now - next).as_nanos() / interval.as_nanos();
        let ticks = u64::try_from(missed).unwrap_or(u64::MAX).saturating_add(1);
        let skip = interval
            .as_nanos()
            .saturating_mul(u128::from(ticks))
            .try_into()
            .map(Duration::from_nanos)
            .unwrap_or(Duration::MAX);

        self.next = next.checked_add(skip);
        ticks
    }
}

impl SourceState {
    fn is_running(&self) -> bool {
        self.suspend_count == 0 && !self.cancelled
    }
}

impl SourceInner {
    fn new(queue: Queue, kind: SourceKind) -> Arc<Self> {
        Arc::new(Self {
            queue,
            kind,
            state: Mutex::new(SourceState {
                suspend_count: 1,
                activated: false,
                cancelled: false,
                handler: None,
                start_handler: None,
                cancel_handler: None,
                pending: 0,
                busy: false,
                timer: None,
                generation: 0,
            }),
            data: AtomicU64::new(0),
        })
    }

    fn handle(self: &Arc<Self>) -> Source {
        Source {
            inner: Arc::clone(self),
        }
    }

    /// Called by the timer driver once a deadline registered by `arm` passed.
    pub(crate) fn on_deadline(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        if state.cancelled || generation != state.generation {
            return;
        }

        let Some(timer) = state.timer.as_mut() else {
            return;
        };
        timer.armed = false;

        // While suspended the tick stays owed, `resume` catches up.
        if !state.is_running() {
            return;
        }

        self.catch_up(&mut state, Instant::now());
        self.schedule_delivery(&mut state);
    }

    /// Counts the deadlines that passed into `pending` and registers the next
    /// one with the driver.
    fn catch_up(self: &Arc<Self>, state: &mut SourceState, now: Instant) {
        let ticks = match state.timer.as_mut() {
            Some(timer) if !timer.armed => timer.advance(now),
            _ => return,
        };

        state.pending = state.pending.saturating_add(ticks);
        self.arm(state);
    }

    fn arm(self: &Arc<Self>, state: &mut SourceState) {
        let generation = state.generation;
        let Some(timer) = state.timer.as_mut() else {
            return;
        };
        if timer.armed {
            return;
        }
        let Some(next) = timer.next else {
            return;
        };

        timer.armed = true;
        let target = Target::Source {
            source: Arc::downgrade(self),
            generation,
        };
        runtime::handle().driver().schedule(next, timer.leeway, target);
    }

    fn set_timer(
        self: &Arc<Self>,
        first: Option<Instant>,
        interval: Option<Duration>,
        leeway: Duration,
    ) -> Result<(), SourceError> {
        if interval.is_some_and(|interval| interval.is_zero()) {
            return Err(SourceError::ZeroInterval);
        }

        let mut state = self.state.lock();
        if state.cancelled {
            return Err(SourceError::Cancelled);
        }

        state.generation += 1;
        state.pending = 0;
        state.timer = Some(TimerState {
            next: first,
            interval,
            leeway,
            armed: false,
        });

        if state.is_running() {
            self.arm(&mut state);
        }

        Ok(())
    }

    fn merge(self: &Arc<Self>, value: u64) {
        let mut state = self.state.lock();
        if state.cancelled {
            return;
        }

        state.pending = match self.kind {
            SourceKind::Data(DataSourceKind::Add) => state.pending.saturating_add(value),
            SourceKind::Data(DataSourceKind::Or) => state.pending | value,
            SourceKind::Timer => return,
        };

        self.schedule_delivery(&mut state);
    }

    fn schedule_delivery(self: &Arc<Self>, state: &mut SourceState) {
        if state.busy || state.pending == 0 || !state.is_running() {
            return;
        }

        state.busy = true;
        let inner = Arc::clone(self);
        self.queue.submit(move || inner.deliver());
    }

    fn deliver(self: &Arc<Self>) {
        let (handler, data) = {
            let mut state = self.state.lock();
            if !state.is_running() || state.pending == 0 {
                // Cancelled or suspended since the delivery was queued.
                drop(state);
                return self.finish_delivery();
            }

            (state.handler.clone(), mem::take(&mut state.pending))
        };

        self.data.store(data, Ordering::Release);
        if let Some(handler) = handler {
            self.call("event", || handler(&self.handle()));
        }

        self.finish_delivery();
    }

    fn start(self: &Arc<Self>, start_handler: OnceHandler) {
        self.call("start", || start_handler(&self.handle()));
        self.finish_delivery();
    }

    fn finish_delivery(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.busy = false;

        if state.cancelled {
            self.dispatch_cancel(&mut state);
        } else {
            self.schedule_delivery(&mut state);
        }
    }

    fn dispatch_cancel(self: &Arc<Self>, state: &mut SourceState) {
        if let Some(cancel_handler) = state.cancel_handler.take() {
            let inner = Arc::clone(self);
            self.queue
                .submit(move || inner.call("cancel", || cancel_handler(&inner.handle())));
        }
    }

    fn call(&self, handler: &'static str, f: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            tracing::error!(
                queue = %self.queue,
                handler,
                panic = panic_message(&*payload),
                "source handler panicked"
            );
        }
    }

    fn resume(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.cancelled {
            return;
        }

        if state.suspend_count == 0 {
            tracing::warn!(queue = %self.queue, kind = ?self.kind, "ignoring resume of a running source");
            return;
        }

        state.suspend_count -= 1;
        if state.suspend_count > 0 {
            return;
        }

        self.catch_up(&mut state, Instant::now());

        if !state.activated {
            state.activated = true;
            if let Some(start_handler) = state.start_handler.take() {
                // Holds back events until the start handler returned.
                state.busy = true;
                let inner = Arc::clone(self);
                self.queue.submit(move || inner.start(start_handler));
                return;
            }
        }

        self.schedule_delivery(&mut state);
    }

    fn suspend(&self) {
        let mut state = self.state.lock();
        if !state.cancelled {
            state.suspend_count += 1;
        }
    }

    fn cancel(self: &Arc<Self>) {
        let released = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }

            state.cancelled = true;
            state.generation += 1;
            state.pending = 0;
            state.timer = None;

            if !state.busy {
                self.dispatch_cancel(&mut state);
            }

            (state.handler.take(), state.start_handler.take())
        };

        // User closures are dropped outside the lock.
        drop(released);
    }

    /// Drops every handler, then cancels: nothing runs once the owner is
    /// gone.
    fn teardown(self: &Arc<Self>) {
        let released = {
            let mut state = self.state.lock();
            (
                state.handler.take(),
                state.start_handler.take(),
                state.cancel_handler.take(),
            )
        };

        drop(released);
        self.cancel();
    }
}

impl Source {
    pub fn queue(&self) -> &Queue {
        &self.inner.queue
    }

    /// Payload of the event being handled: for a timer, how many deadlines
    /// were merged into it; for a data source, the merged value.
    pub fn data(&self) -> u64 {
        self.inner.data.load(Ordering::Acquire)
    }

    /// Sets the event handler. Events delivered from now on use it.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&Source) + Send + Sync + 'static,
    {
        let mut state = self.inner.state.lock();
        if !state.cancelled {
            state.handler = Some(Arc::new(handler));
        }
    }

    /// Sets the handler run once, on the first `resume`, before any event.
    /// Ignored once the source was resumed.
    pub fn set_start_handler<F>(&self, handler: F)
    where
        F: FnOnce(&Source) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if !state.cancelled && !state.activated {
            state.start_handler = Some(Box::new(handler));
        }
    }

    /// Sets the handler run once after `cancel`, when no event handler is
    /// running anymore.
    pub fn set_cancel_handler<F>(&self, handler: F)
    where
        F: FnOnce(&Source) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if !state.cancelled {
            state.cancel_handler = Some(Box::new(handler));
        }
    }

    /// Undoes one suspension. Resuming a running source is ignored.
    pub fn resume(&self) {
        self.inner.resume();
    }

    /// Stops event delivery until a matching `resume`. A handler already
    /// running is not interrupted.
    pub fn suspend(&self) {
        self.inner.suspend();
    }

    /// Stops the source for good. Events not yet started are discarded.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().is_running()
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Source")
            .field("kind", &self.inner.kind)
            .field("queue", &self.inner.queue)
            .field("suspend_count", &state.suspend_count)
            .field("cancelled", &state.cancelled)
            .field("timer", &state.timer)
            .finish_non_exhaustive()
    }
}
