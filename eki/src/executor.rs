//! Executors: anything that can be handed a unit of work to run.
//!
//! Queues, groups and semaphores all implement [`Executor`], so code that
//! only needs to hand work off can stay agnostic of the discipline applied
//! to it.

use crate::group::Group;
use crate::queue::Queue;
use crate::runtime::Job;
use crate::semaphore::{Mutex, Semaphore};
use std::sync::Arc;

pub trait Executor: Send + Sync {
    fn execute(&self, work: Job);
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, work: Job) {
        (**self).execute(work);
    }
}

impl<E: Executor + ?Sized> Executor for &E {
    fn execute(&self, work: Job) {
        (**self).execute(work);
    }
}

/// Asynchronous submission.
impl Executor for Queue {
    fn execute(&self, work: Job) {
        self.submit_job(work);
    }
}

/// Tracked submission on the group's default queue.
impl Executor for Group {
    fn execute(&self, work: Job) {
        self.submit(work);
    }
}

/// Runs work on the calling thread while holding a permit.
impl Executor for Semaphore {
    fn execute(&self, work: Job) {
        self.perform(work);
    }
}

/// Runs work on the calling thread while holding the lock.
impl Executor for Mutex {
    fn execute(&self, work: Job) {
        self.perform(work);
    }
}

/// Runs work right away on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl Executor for Immediate {
    fn execute(&self, work: Job) {
        work();
    }
}

macro_rules! queue_executor {
    ($(#[$meta:meta])* $name:ident, |$queue:ident, $work:ident| $body:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            queue: Queue,
        }

        impl $name {
            pub(crate) fn new(queue: Queue) -> Self {
                Self { queue }
            }

            pub fn queue(&self) -> &Queue {
                &self.queue
            }
        }

        impl Executor for $name {
            fn execute(&self, $work: Job) {
                let $queue = &self.queue;
                $body
            }
        }
    };
}

queue_executor!(
    /// Blocks the caller until the work ran on the queue.
    SyncExecutor,
    |queue, work| queue.submit_and_wait(work)
);

queue_executor!(
    /// Submits the work as a barrier.
    BarrierExecutor,
    |queue, work| queue.submit_barrier(work)
);

queue_executor!(
    /// Blocks the caller until the work ran as a barrier.
    BarrierSyncExecutor,
    |queue, work| queue.submit_barrier_and_wait(work)
);

/// Registers work as a completion notification of a group.
#[derive(Debug, Clone)]
pub struct NotifyExecutor {
    group: Group,
}

impl NotifyExecutor {
    pub(crate) fn new(group: Group) -> Self {
        Self { group }
    }
}

impl Executor for NotifyExecutor {
    fn execute(&self, work: Job) {
        self.group.notify(work);
    }
}
