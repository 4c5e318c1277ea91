//! Error types shared by the coordination primitives.

use thiserror::Error;

/// Failure talking to shared infrastructure (KV store or database).
///
/// These are transient by assumption: callers degrade to a documented fallback
/// rather than propagating them out of a scheduled tick.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached (connection refused, pool closed, timeout).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store was reached but the command failed.
    #[error("store command failed: {0}")]
    Command(String),

    /// A stored value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }
}

/// Failure of a unit of work executed by a coordinator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// The claimed record cannot be processed as-is (e.g. a job with no recipients).
    #[error("invalid record: {0}")]
    Invalid(String),

    /// A collaborator or upstream service failed.
    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The unit of work panicked; the payload message is preserved when it is a string.
    #[error("unit of work panicked: {0}")]
    Panicked(String),
}

impl JobError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }
}
