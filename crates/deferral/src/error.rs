//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler loop is no longer accepting commands.
    #[error("scheduler loop has stopped")]
    Stopped,

    /// The scheduler loop dropped a query before replying.
    #[error("scheduler loop dropped the response")]
    ResponseDropped,

    /// Started outside a tokio runtime.
    #[error("scheduler must be started from within a tokio runtime")]
    NoRuntime,

    /// Invalid scheduler configuration.
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),
}
