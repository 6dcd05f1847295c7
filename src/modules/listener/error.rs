//! Listener server error types.

use thiserror::Error;

use crate::modules::transport::TransportError;

/// Errors that can occur in the listener server.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The server is already closed.
    #[error("server is not running")]
    NotRunning,

    /// Binding the listener failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type for listener server operations.
pub type ListenerResult<T> = Result<T, ListenerError>;
