#![forbid(unsafe_code)]
//! Error types for lazywright.
//!
//! Defines `LwError` and a `Result<T>` alias used throughout the workspace,
//! plus the expected-failure classification applied by the worker pool.

use thiserror::Error;

/// Unified error type for all lazywright operations.
#[derive(Debug, Error)]
pub enum LwError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("insufficient resources to queue work")]
    InsufficientResources,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("backend failure: {0}")]
    Backend(String),

    #[error("unknown stream {0}")]
    UnknownStream(u64),

    #[error("stream {0} is already registered")]
    AlreadyRegistered(u64),

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl LwError {
    /// Whether a worker thread may swallow this failure and keep draining.
    ///
    /// Transient I/O and backend conditions are expected around flush
    /// dispatch; the stream stays dirty and a later scan retries. Anything
    /// else surfacing inside a worker indicates a defect in the engine and
    /// is treated as fatal by the caller.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        match self {
            Self::Io(_) | Self::Backend(_) | Self::InsufficientResources => true,
            Self::Config(_)
            | Self::UnknownStream(_)
            | Self::AlreadyRegistered(_)
            | Self::ShuttingDown => false,
        }
    }
}

/// Result alias using `LwError`.
pub type Result<T> = std::result::Result<T, LwError>;
