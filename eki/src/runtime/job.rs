use crate::runtime::Latch;
use parking_lot::Mutex;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

/// A unit of work as stored by queues and the worker pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Erases the lifetime of a job that borrows from its caller's stack.
///
/// # Safety
///
/// The caller must not return, nor unwind, until the job has finished
/// running or has been dropped. Blocking on the `JobResult` returned by
/// [`scoped`] satisfies this, as the job completes the result as its last
/// access to borrowed data.
pub(crate) unsafe fn erase_lifetime<'a>(job: Box<dyn FnOnce() + Send + 'a>) -> Job {
    // Safety: only the lifetime bound differs between the two fat pointers,
    // the caller upholds that borrows outlive the job.
    unsafe { mem::transmute::<Box<dyn FnOnce() + Send + 'a>, Job>(job) }
}

/// Outcome of a scoped job. Shared between the job and the blocked caller,
/// so setting the latch never touches the caller's stack.
pub(crate) struct JobResult<R> {
    value: Mutex<Option<thread::Result<R>>>,
    latch: Latch,
}

impl<R> JobResult<R> {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
            latch: Latch::new(),
        }
    }

    fn complete(&self, value: thread::Result<R>) {
        *self.value.lock() = Some(value);
        self.latch.set();
    }

    /// Blocks until the job ran. A panic raised by the work is handed back as
    /// `Err` for the caller to resume.
    pub(crate) fn wait(&self) -> thread::Result<R> {
        self.latch.wait();
        match self.value.lock().take() {
            Some(value) => value,
            None => unreachable!("job result latch set without a value"),
        }
    }
}

/// Wraps `work` into a job reporting its return value, or its panic, through
/// the returned `JobResult`.
pub(crate) fn scoped<'a, F, R>(work: F) -> (Box<dyn FnOnce() + Send + 'a>, Arc<JobResult<R>>)
where
    F: FnOnce() -> R + Send + 'a,
    R: Send + 'a,
{
    let result = Arc::new(JobResult::new());
    let job = {
        let result = Arc::clone(&result);
        Box::new(move || result.complete(panic::catch_unwind(AssertUnwindSafe(work))))
    };

    (job, result)
}
