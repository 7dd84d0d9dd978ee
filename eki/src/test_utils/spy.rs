use crate::executor::Executor;
use crate::runtime::Job;
use dashmap::DashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    Execute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Execute { thread: ThreadId },
}

#[derive(Debug, Clone)]
pub(crate) struct Tracker {
    calls: Arc<DashMap<Method, Vec<Call>>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        let map = DashMap::new();
        map.insert(Method::Execute, Vec::new());

        Self {
            calls: Arc::new(map),
        }
    }

    pub(crate) fn record(&self, method: Method, call: Call) {
        self.calls
            .get_mut(&method)
            .expect("method not found")
            .push(call)
    }

    pub(crate) fn get_calls(&self, method: &Method) -> Vec<Call> {
        self.calls
            .get(method)
            .expect("method not found")
            .value()
            .clone()
    }

    pub(crate) fn num_calls(&self, method: &Method) -> usize {
        self.calls.get(method).map_or(0, |calls| calls.len())
    }
}

/// Wraps an executor and records every job handed to it.
#[derive(Debug, Clone)]
pub(crate) struct SpyExecutor<E> {
    pub(crate) inner: E,
    pub(crate) tracker: Tracker,
}

impl<E> SpyExecutor<E> {
    pub(crate) fn new(inner: E) -> Self {
        Self {
            inner,
            tracker: Tracker::new(),
        }
    }
}

impl<E: Executor> Executor for SpyExecutor<E> {
    fn execute(&self, work: Job) {
        self.tracker.record(
            Method::Execute,
            Call::Execute {
                thread: thread::current().id(),
            },
        );
        self.inner.execute(work);
    }
}
