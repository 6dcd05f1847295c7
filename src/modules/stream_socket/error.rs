//! Stream socket error types.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors reported by a [`StreamSocket`](super::StreamSocket).
///
/// Cloneable so a single failure can reach both a pending write callback and
/// the socket's event subscribers.
#[derive(Debug, Clone, Error)]
pub enum SocketError {
    /// A write was issued while a previous one was still pending.
    #[error("overlapping write: a previous write is still pending")]
    OverlappingWrite,

    /// The socket has no connection to write to.
    #[error("socket is not connected")]
    NotConnected,

    /// The socket is closed or its write side has ended.
    #[error("socket is closed")]
    Closed,

    /// The socket was destroyed.
    #[error("socket was destroyed")]
    Destroyed,

    /// The transport refused the TLS upgrade.
    #[error("TLS upgrade failed: invalid socket")]
    TlsUpgradeFailed,

    /// The TLS handshake failed or the peer failed verification.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// Dialing out failed.
    #[error("connect failed: {0}")]
    Connect(Arc<io::Error>),

    /// The transport reported an I/O error.
    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),
}

impl SocketError {
    /// Wrap a transport I/O error.
    #[must_use]
    pub fn transport(error: io::Error) -> Self {
        Self::Transport(Arc::new(error))
    }
}

/// Result type for socket operations.
pub type SocketResult<T> = Result<T, SocketError>;
