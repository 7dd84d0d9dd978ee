use crate::context::{self, Shared};
use crate::queue::Priority;
use crate::runtime::driver::Driver;
use crate::runtime::pool::ThreadPool;
use crate::runtime::{Job, RuntimeError};
use anyhow::{Result, bail};
use std::convert::TryFrom;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

/// Lower bound on the default number of core workers. A single core worker
/// would serialize every concurrent queue on small machines.
const MIN_WORKER_THREADS: usize = 2;

/// Cap on core and overflow workers together.
const MAX_THREADS: usize = 64;

/// How long an overflow worker stays idle before exiting.
const KEEP_ALIVE: Duration = Duration::from_secs(10);

/// Every N ticks a worker scans priority classes from the lowest up.
const FAIRNESS_INTERVAL: u32 = 31;

/// Maximum number of stealing attempts.
const MAX_STEAL_RETRIES: usize = 3;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("eki-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

#[derive(Debug)]
pub struct Builder {
    /// Number of core workers. Defaults to 1 per CPU core, and at least
    /// `MIN_WORKER_THREADS`.
    worker_threads: Option<usize>,

    /// Upper bound on live workers, overflow workers included.
    max_threads: usize,

    /// Name fn used for threads spawned by the runtime.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the runtime.
    thread_stack_size: Option<usize>,

    /// How long a worker above `worker_threads` may stay idle before exiting.
    keep_alive: Duration,

    /// How many ticks before a worker serves the lowest priority class first.
    fairness_interval: u32,

    /// How many times a worker retries the injectors when they report
    /// contention, before parking.
    max_steal_retries: usize,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            max_threads: MAX_THREADS,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            keep_alive: KEEP_ALIVE,
            fairness_interval: FAIRNESS_INTERVAL,
            max_steal_retries: MAX_STEAL_RETRIES,
        }
    }

    /// The number of core worker threads. These never exit while the runtime
    /// is alive.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// The maximum number of workers alive at once. Extra workers beyond
    /// `worker_threads` are started when every worker is blocked waiting on
    /// queued work, for example in nested `submit_and_wait` calls.
    #[track_caller]
    pub fn max_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "max_threads must be greater than 0");
        self.max_threads = val;
        self
    }

    /// Sets name of threads spawned by the `Runtime`'s thread pool.
    ///
    /// The default name is "eki-{id}", where id is monotonically increasing.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// `Runtime`'s thread pool.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies minimal stack size.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    #[track_caller]
    pub fn keep_alive(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "keep_alive must be greater than 0");
        self.keep_alive = val;
        self
    }

    /// Sets the number of ticks after which a worker serves the lowest
    /// priority class first. Setting it to `1` ignores priorities entirely,
    /// a higher value starves background work longer under load.
    #[track_caller]
    pub fn fairness_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "fairness_interval must be greater than 0");
        self.fairness_interval = val;
        self
    }

    #[track_caller]
    pub fn max_steal_retries(mut self, val: usize) -> Self {
        assert!(val > 0, "max_steal_retries must be greater than 0");
        self.max_steal_retries = val;
        self
    }

    /// Creates a standalone `Runtime`, independent of the global one used by
    /// queues.
    pub fn try_build(self) -> Result<Runtime> {
        let cfg = RuntimeConfig::try_from(self)?;
        Runtime::start(cfg)
    }

    /// Builds the runtime and installs it as the global one, used by every
    /// queue, group, task and timer.
    ///
    /// Fails if the global runtime already exists, either from a previous call
    /// or because a queue was used before.
    pub fn try_init(self) -> Result<&'static Runtime> {
        if GLOBAL.get().is_some() {
            bail!(RuntimeError::AlreadyInitialized);
        }

        let runtime = self.try_build()?;
        if let Err(rejected) = GLOBAL.set(runtime) {
            // Lost a race against lazy initialization.
            drop(rejected);
            bail!(RuntimeError::AlreadyInitialized);
        }

        Ok(handle())
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: OnceLock<Runtime> = OnceLock::new();

/// Returns the global runtime, starting it with the default configuration on
/// first use.
pub fn handle() -> &'static Runtime {
    GLOBAL.get_or_init(|| match Builder::new().try_build() {
        Ok(runtime) => runtime,
        Err(e) => panic!("failed to start the eki runtime: {e:#}"),
    })
}

pub struct Runtime {
    shared: Arc<Shared>,
    pool: ThreadPool,
    driver: Arc<Driver>,
    is_shutdown: AtomicBool,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("worker_threads", &self.shared.cfg.worker_threads)
            .field("live_workers", &self.shared.live_workers())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    fn start(cfg: RuntimeConfig) -> Result<Self> {
        let shared = Arc::new(Shared::new(&cfg));
        let driver = Driver::start()?;

        let pool = match ThreadPool::new(&shared) {
            Ok(pool) => pool,
            Err(e) => {
                driver.shutdown();
                return Err(e);
            }
        };

        tracing::debug!(
            worker_threads = cfg.worker_threads,
            max_threads = cfg.max_threads,
            "runtime started"
        );

        Ok(Self {
            shared,
            pool,
            driver,
            is_shutdown: AtomicBool::new(false),
        })
    }

    /// Runs `work` on the pool at the default priority.
    pub fn spawn<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_job(Priority::Default, Box::new(work));
    }

    /// Runs `work` on the pool. Workers serve higher priority classes first.
    pub fn spawn_with_priority<F>(&self, priority: Priority, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_job(priority, Box::new(work));
    }

    pub(crate) fn spawn_job(&self, priority: Priority, job: Job) {
        self.shared.push(priority, job);
    }

    pub fn worker_threads(&self) -> usize {
        self.shared.cfg.worker_threads
    }

    /// Workers currently alive, overflow workers included.
    pub fn live_workers(&self) -> usize {
        self.shared.live_workers()
    }

    /// How many jobs can usefully run side by side.
    pub(crate) fn parallelism(&self) -> usize {
        self.shared.live_workers().max(self.shared.cfg.worker_threads)
    }

    pub(crate) fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Shutdown the runtime.
    ///
    /// Workers finish the job they are running, then exit. Jobs still queued
    /// are dropped without running. The calling thread blocks until the core
    /// workers have exited, unless it is one of them.
    pub fn shutdown(self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&self) {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shared.shutdown.store(true, Ordering::Release);
        let unparked = self.shared.unpark_all_threads();
        self.driver.shutdown();

        tracing::debug!(unparked, "runtime shutting down");

        // Joining from one of our own workers would wait on ourselves.
        let on_own_worker = context::current_worker()
            .is_some_and(|shared| Arc::ptr_eq(&shared, &self.shared));

        if on_own_worker {
            return;
        }

        if let Err(e) = self.pool.join_all() {
            tracing::error!("error during runtime shutdown: {e:#}");
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

// Export runtime builder as a RuntimeConfig object consumed by the pool and
// its workers.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) worker_threads: usize,
    pub(crate) max_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) keep_alive: Duration,
    pub(crate) fairness_interval: u32,
    pub(crate) max_steal_retries: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: MIN_WORKER_THREADS,
            max_threads: MAX_THREADS,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            keep_alive: KEEP_ALIVE,
            fairness_interval: FAIRNESS_INTERVAL,
            max_steal_retries: MAX_STEAL_RETRIES,
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.max_threads < self.worker_threads {
            bail!(
                "max_threads ({}) must be at least worker_threads ({})",
                self.max_threads,
                self.worker_threads
            );
        }

        Ok(())
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get().max(MIN_WORKER_THREADS),
        };

        let cfg = RuntimeConfig {
            worker_threads,
            // Only an explicit `max_threads` below the core count is an
            // error, the default cap grows with large machines.
            max_threads: if builder.max_threads == MAX_THREADS {
                builder.max_threads.max(worker_threads)
            } else {
                builder.max_threads
            },
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            keep_alive: builder.keep_alive,
            fairness_interval: builder.fairness_interval,
            max_steal_retries: builder.max_steal_retries,
        };

        cfg.validate()?;
        Ok(cfg)
    }
}
