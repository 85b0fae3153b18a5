//! Error types for scheduling and generation

use provider::GenerationError;

/// Errors from pool construction and generation requests.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No credentials configured. Fatal at startup.
    #[error("credential pool is empty")]
    EmptyPool,

    #[error("invalid quota policy: {0}")]
    InvalidPolicy(String),

    /// The attempt plan has no entries, so no call was made.
    #[error("no attempts configured")]
    NoAttemptsConfigured,

    #[error("error after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: GenerationError,
    },
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
