use thiserror::Error;

/// Signals raised by the replicated cache and by cache procedures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Procedure asks for the whole transaction to be retried.
    #[error("transaction retry requested")]
    Retry,
    /// Commit lost against a concurrent writer of the same key.
    #[error("conflicting update on commit")]
    Conflict,
    #[error("transaction deadline elapsed")]
    TimedOut,
    #[error("cache operation failed: {0}")]
    Failed(String),
}

impl CacheError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retry | Self::Conflict)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cache transaction failed: {0}")]
    Cache(#[from] CacheError),
    /// Malformed request, aborted before any network side effect.
    #[error("{0}")]
    Fatal(String),
    #[error("malformed cluster message")]
    Malformed(#[from] MalformedMessage),
    #[error("configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Error)]
#[error("malformed message")]
pub struct MalformedMessage;

pub type Result<T, E = Error> = std::result::Result<T, E>;
