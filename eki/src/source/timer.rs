use crate::queue::Queue;
use crate::source::{Source, SourceError, SourceInner, SourceKind};
use bitflags::bitflags;
use std::ops::Deref;
use std::time::{Duration, Instant, SystemTime};

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct TimerFlags: u8 {
        /// Fire as close to the deadline as possible, ignoring leeway.
        const STRICT = 1;
    }
}

/// When a timer first fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartTime {
    /// Relative to the moment the timer is scheduled.
    After(Duration),

    /// Wall-clock time, converted to a monotonic deadline when the timer is
    /// scheduled. A time in the past fires right away.
    At(SystemTime),
}

impl StartTime {
    /// `None` when the deadline is too far out to be represented.
    fn deadline(self, now: Instant) -> Option<Instant> {
        match self {
            StartTime::After(delay) => now.checked_add(delay),
            StartTime::At(time) => match time.duration_since(SystemTime::now()) {
                Ok(delay) => now.checked_add(delay),
                Err(_) => Some(now),
            },
        }
    }
}

impl From<Duration> for StartTime {
    fn from(delay: Duration) -> Self {
        StartTime::After(delay)
    }
}

impl From<SystemTime> for StartTime {
    fn from(time: SystemTime) -> Self {
        StartTime::At(time)
    }
}

/// One-shot or repeating timer delivering events on a queue.
///
/// Created suspended: call [`resume`](Source::resume) to start it. Dropping
/// the timer releases its handlers, without running the cancel handler, and
/// cancels it.
pub struct Timer {
    source: Source,
    flags: TimerFlags,
}

impl Timer {
    pub fn new(queue: Queue) -> Self {
        Self::with_flags(queue, TimerFlags::empty())
    }

    pub fn with_flags(queue: Queue, flags: TimerFlags) -> Self {
        Self {
            source: Source {
                inner: SourceInner::new(queue, SourceKind::Timer),
            },
            flags,
        }
    }

    /// Creates a running timer first firing after `interval`, and every
    /// `interval` thereafter if `repeats`.
    pub fn scheduled_with_interval<F>(
        interval: Duration,
        queue: Queue,
        repeats: bool,
        handler: F,
    ) -> Result<Self, SourceError>
    where
        F: Fn(&Source) + Send + Sync + 'static,
    {
        let timer = Self::new(queue);
        timer.schedule(interval, repeats.then_some(interval), Duration::ZERO)?;
        timer.set_handler(handler);
        timer.resume();
        Ok(timer)
    }

    /// Creates a running one-shot timer firing at `date`.
    pub fn scheduled_at<F>(date: SystemTime, queue: Queue, handler: F) -> Result<Self, SourceError>
    where
        F: Fn(&Source) + Send + Sync + 'static,
    {
        let timer = Self::new(queue);
        timer.schedule(date, None, Duration::ZERO)?;
        timer.set_handler(handler);
        timer.resume();
        Ok(timer)
    }

    /// Sets when the timer fires, replacing any previous schedule.
    ///
    /// The timer never fires before a deadline, and fires within `leeway`
    /// after it unless the system is overloaded. With `repeat` set, the
    /// timer fires every `repeat` after `start`; deadlines passed while an
    /// event is pending or the timer is suspended are merged into one event.
    pub fn schedule(
        &self,
        start: impl Into<StartTime>,
        repeat: Option<Duration>,
        leeway: Duration,
    ) -> Result<(), SourceError> {
        let leeway = if self.flags.contains(TimerFlags::STRICT) {
            Duration::ZERO
        } else {
            leeway
        };

        let first = start.into().deadline(Instant::now());
        self.source.inner.set_timer(first, repeat, leeway)
    }

    pub fn flags(&self) -> TimerFlags {
        self.flags
    }

    pub fn source(&self) -> &Source {
        &self.source
    }
}

impl Deref for Timer {
    type Target = Source;

    fn deref(&self) -> &Source {
        &self.source
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.source.inner.teardown();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("source", &self.source)
            .field("flags", &self.flags)
            .finish()
    }
}
