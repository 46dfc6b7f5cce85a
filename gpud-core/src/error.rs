//! Error types shared by the registry, runtime and escalation engine

use std::time::Duration;

use thiserror::Error;

/// Errors returned by core operations
#[derive(Debug, Error)]
pub enum Error {
    /// No component registered under the name
    #[error("component not found: {0}")]
    NotFound(String),

    /// A component with the same name is already registered
    #[error("component already registered: {0}")]
    AlreadyExists(String),

    /// Lifecycle has been cancelled, the operation can no longer run
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Caller passed input the operation cannot evaluate
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A bounded sub-operation exceeded its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Error raised by a component while initializing
    #[error("failed to initialize component: {0}")]
    Init(String),
}

pub type Result<T> = std::result::Result<T, Error>;
