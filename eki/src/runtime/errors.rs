use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("the global runtime is already initialized")]
    AlreadyInitialized,

    #[error("worker limit reached: {max} threads are already alive")]
    TooManyThreads { max: usize },

    #[error("failed to spawn thread {name:?}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}
