//! Thread-local execution context.
//!
//! Every thread carries the stack of queues whose work it is currently
//! executing (innermost last). `Queue::is_current` is answered from this
//! stack, which is what lets `submit_and_wait` run inline instead of
//! deadlocking on its own queue. Pool workers additionally remember the
//! runtime they belong to, so blocking calls can ask that runtime for a
//! replacement worker.

use crate::queue::QueueId;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread_local;

// Exports
pub(crate) mod shared;
pub(crate) use shared::Shared;

struct Context {
    queues: RefCell<Vec<QueueId>>,

    /// Set once on pool worker threads, never cleared.
    worker: RefCell<Option<Arc<Shared>>>,
}

thread_local! {
    static CONTEXT: Context = const {
        Context {
            queues: RefCell::new(Vec::new()),
            worker: RefCell::new(None),
        }
    };
}

/// Marks the current thread as executing work submitted to `id`. The tag is
/// removed when the returned scope is dropped, including while unwinding.
#[must_use]
pub(crate) fn enter_queue(id: QueueId) -> QueueScope {
    CONTEXT.with(|ctx| ctx.queues.borrow_mut().push(id));
    QueueScope {
        id,
        _not_send: PhantomData,
    }
}

pub(crate) fn is_current(id: QueueId) -> bool {
    CONTEXT.with(|ctx| ctx.queues.borrow().contains(&id))
}

pub(crate) struct QueueScope {
    id: QueueId,

    // The tag lives on the thread that pushed it.
    _not_send: PhantomData<*const ()>,
}

impl Drop for QueueScope {
    fn drop(&mut self) {
        CONTEXT.with(|ctx| {
            let popped = ctx.queues.borrow_mut().pop();
            debug_assert_eq!(popped, Some(self.id), "queue scopes must nest");
        });
    }
}

pub(crate) fn init_worker_context(shared: Arc<Shared>) {
    CONTEXT.with(|ctx| {
        let mut worker = ctx.worker.borrow_mut();
        debug_assert!(worker.is_none(), "worker context initialized twice");
        *worker = Some(shared);
    });
}

/// Runtime owning the current thread, if it is a pool worker.
pub(crate) fn current_worker() -> Option<Arc<Shared>> {
    CONTEXT.with(|ctx| ctx.worker.borrow().clone())
}
