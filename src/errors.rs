//! Error types for flow execution and host registry operations

use thiserror::Error;

/// Errors that can occur while materializing or running a flow
#[derive(Debug, Error)]
pub enum FlowError {
    /// Filter expression could not be parsed
    #[error("invalid filter syntax: {0}")]
    FilterSyntax(String),

    /// Service registration with the host registry failed
    #[error("service registration error: {0}")]
    Registration(String),

    /// Service or bundle tracker error
    #[error("tracker error: {0}")]
    Tracker(String),

    /// Configuration listener error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Generic host registry error
    #[error("host registry error: {0}")]
    Host(String),
}

/// Result type for flow operations
pub type FlowResult<T> = Result<T, FlowError>;
