//! Error types for sampling, caching and coordination

use thiserror::Error;

/// Main error type for the crate
///
/// `Clone` so that a single failed computation can be delivered to every
/// caller attached to the same in-flight request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Sampling configuration rejected before any computation
    #[error("Invalid sampling config: {0}")]
    InvalidConfig(String),

    /// Series violates the ordering invariant
    #[error("Invalid series: {0}")]
    InvalidSeries(String),

    /// Sampling worker failed
    #[error("Executor error: {0}")]
    Executor(String),

    /// Sampling worker did not answer in time
    #[error("Executor timed out after {millis} ms")]
    Timeout {
        /// Configured timeout in milliseconds
        millis: u64,
    },

    /// Upstream series provider failed
    #[error("Provider error: {0}")]
    Provider(String),

    /// Requested series or cached entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration file or environment error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error (task panicked, channel closed)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidConfig(_) => "invalid_config",
            Error::InvalidSeries(_) => "invalid_series",
            Error::Executor(_) => "executor",
            Error::Timeout { .. } => "timeout",
            Error::Provider(_) => "provider",
            Error::NotFound(_) => "not_found",
            Error::Configuration(_) => "configuration",
            Error::Internal(_) => "internal",
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
