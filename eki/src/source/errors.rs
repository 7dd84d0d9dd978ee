use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SourceError {
    #[error("repeat interval must be greater than zero")]
    ZeroInterval,

    #[error("source is cancelled")]
    Cancelled,
}
