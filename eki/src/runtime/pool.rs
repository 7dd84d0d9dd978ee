use crate::context::Shared;
use crate::runtime::worker::Worker;
use crate::runtime::{Latch, RuntimeError};
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, ThreadId};

/// Owns the core workers. Overflow workers started by `block_in_place` are
/// detached, they exit on their own once idle or on shutdown.
#[derive(Debug)]
pub(super) struct ThreadPool {
    handles: Mutex<Vec<(ThreadId, thread::JoinHandle<()>)>>,
}

impl ThreadPool {
    pub(super) fn new(shared: &Arc<Shared>) -> Result<Self> {
        let num_workers = shared.cfg.worker_threads;

        // Workers hold at the gate until the whole pool is up, or until we
        // give up on it because a spawn failed.
        let gate = Arc::new(Latch::new());
        let spawned = (0..num_workers)
            .map(|_| spawn_worker(shared, Some(Arc::clone(&gate))))
            .collect::<Result<Vec<_>>>();

        if spawned.is_err() {
            shared.shutdown.store(true, Ordering::Release);
        }
        gate.set();

        let handles = spawned?
            .into_iter()
            .map(|handle| (handle.thread().id(), handle))
            .collect();

        tracing::debug!(num_workers, "thread pool started");

        Ok(Self {
            handles: Mutex::new(handles),
        })
    }

    pub(super) fn join_all(&self) -> Result<()> {
        let mut handles = self.handles.lock();

        let errors = handles
            .drain(..)
            .filter_map(|(thread_id, handle)| handle.join().err().map(|_| thread_id))
            .collect::<Vec<_>>();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{} thread(s) panicked: {:?}", errors.len(), errors))
        }
    }
}

/// Spawns a worker thread, provided fewer than `max_threads` are alive.
pub(super) fn spawn_worker(
    shared: &Arc<Shared>,
    gate: Option<Arc<Latch>>,
) -> Result<thread::JoinHandle<()>> {
    if !shared.try_reserve_worker() {
        return Err(RuntimeError::TooManyThreads {
            max: shared.cfg.max_threads,
        }
        .into());
    }

    let name = (shared.cfg.thread_name.0)();
    let mut builder = thread::Builder::new().name(name.clone());

    if let Some(stack_size) = shared.cfg.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    let worker = Worker::new(Arc::clone(shared));

    builder
        .spawn(move || {
            if let Some(gate) = gate {
                gate.wait();
            }
            worker.run();
        })
        .map_err(|source| {
            shared.release_worker();
            RuntimeError::Spawn { name, source }.into()
        })
}

/// Adds a worker beyond the core pool because every live worker is blocked.
pub(crate) fn spawn_overflow_worker(shared: &Arc<Shared>) {
    match spawn_worker(shared, None) {
        Ok(_detached) => tracing::debug!(
            live_workers = shared.live_workers(),
            "spawned overflow worker"
        ),
        Err(e) => tracing::error!("failed to spawn overflow worker: {e:#}"),
    }
}
