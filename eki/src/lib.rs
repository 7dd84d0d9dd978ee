//! Queue-based concurrency primitives.
//!
//! Work is submitted as closures to [`Queue`]s, which decide ordering and
//! exclusion, and runs on a shared worker pool started on first use. See
//! [`runtime::Builder`] to configure the pool before that.

mod context;

pub mod executor;
pub use executor::Executor;

pub mod group;
pub use group::Group;

pub mod queue;
pub use queue::{Priority, Queue, QueueKind};

pub mod runtime;

pub mod semaphore;
pub use semaphore::{Locked, Mutex, Semaphore, SemaphoreKind};

pub mod source;
pub use source::{DataSource, DataSourceKind, Source, SourceError, StartTime, Timer, TimerFlags};

pub mod task;
pub use task::Task;

mod utils;

#[cfg(test)]
mod test_utils;
