//! Transport error types.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur while binding, dialing or configuring a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {address}: {source}")]
    BindError {
        /// The address that failed to bind.
        address: SocketAddr,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The listen or connect address could not be resolved.
    #[error("invalid address '{address}'")]
    InvalidAddress {
        /// The address as configured.
        address: String,
    },

    /// No tokio runtime is available on the current thread.
    #[error("no reactor available: {0}")]
    NoReactor(String),

    /// Failed to load certificate.
    #[error("failed to load certificate from '{path}': {message}")]
    CertificateLoadError {
        /// The certificate path.
        path: String,
        /// Error message.
        message: String,
    },

    /// Failed to load private key.
    #[error("failed to load private key from '{path}': {message}")]
    PrivateKeyLoadError {
        /// The private key path.
        path: String,
        /// Error message.
        message: String,
    },

    /// TLS configuration error.
    #[error("TLS configuration error: {message}")]
    TlsConfigError {
        /// Error message.
        message: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
