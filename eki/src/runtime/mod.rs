// Public API
pub mod runtime;
pub use runtime::{Builder, Runtime, handle};

mod errors;
pub use errors::RuntimeError;

pub(crate) use runtime::RuntimeConfig;

pub(crate) mod job;
pub use job::Job;

pub(crate) mod latch;
pub(crate) use latch::Latch;

mod blocking;
pub(crate) use blocking::block_in_place;

pub(crate) mod driver;
pub(crate) use driver::Target;

mod pool;
mod ticker;
mod worker;
