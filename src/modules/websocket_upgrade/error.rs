//! WebSocket upgrade error types.

use http::StatusCode;
use thiserror::Error;

use crate::modules::listener::ListenerError;
use crate::modules::transport::TransportError;

/// Result type for a single upgrade handshake.
pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// Result type for upgrade server operations.
pub type UpgradeResult<T> = Result<T, UpgradeError>;

/// Why an upgrade request was refused.
///
/// Every variant maps to the HTTP status written in the abort response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The request method is not `GET`.
    #[error("Invalid HTTP method")]
    InvalidMethod,

    /// The `Upgrade` header is missing or is not `websocket`.
    #[error("Invalid Upgrade header")]
    InvalidUpgradeHeader,

    /// The `Sec-WebSocket-Key` header is missing or malformed.
    #[error("Missing or invalid Sec-WebSocket-Key header")]
    InvalidKey,

    /// The `Sec-WebSocket-Version` header is missing or not 8 or 13.
    #[error("Missing or invalid Sec-WebSocket-Version header")]
    InvalidVersion,

    /// The path filter refused the request.
    #[error("request path not handled")]
    PathRejected,

    /// The `Sec-WebSocket-Protocol` header does not parse.
    #[error("Invalid Sec-WebSocket-Protocol header")]
    InvalidSubprotocol,

    /// The verification hook refused the client.
    #[error("client verification failed ({code})")]
    Rejected {
        /// Status code to answer with.
        code: u16,
        /// Reason phrase override.
        message: Option<String>,
        /// Extra response headers.
        headers: Vec<(String, String)>,
    },

    /// The server is closing or closed.
    #[error("server is not running")]
    ServerNotRunning,

    /// The protocol selector chose a protocol the client did not offer.
    #[error("selected subprotocol {0:?} was not offered")]
    UnknownSubprotocol(String),

    /// The promotion primitive refused the connection.
    #[error("connection promotion failed")]
    PromotionFailed,
}

impl HandshakeError {
    /// HTTP status answered for this rejection.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidMethod => 405,
            Self::InvalidUpgradeHeader
            | Self::InvalidKey
            | Self::InvalidVersion
            | Self::PathRejected
            | Self::InvalidSubprotocol => 400,
            Self::Rejected { code, .. } => *code,
            Self::ServerNotRunning => 503,
            Self::UnknownSubprotocol(_) | Self::PromotionFailed => 500,
        }
    }

    /// Response body. Validation failures carry a fixed message, everything
    /// else falls back to the canonical reason of the status code.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::InvalidMethod
            | Self::InvalidUpgradeHeader
            | Self::InvalidKey
            | Self::InvalidVersion
            | Self::InvalidSubprotocol => self.to_string(),
            Self::Rejected {
                message: Some(message),
                ..
            } => message.clone(),
            _ => canonical_reason(self.status_code()).to_string(),
        }
    }

    /// Extra headers for the abort response.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        match self {
            Self::Rejected { headers, .. } => headers,
            _ => &[],
        }
    }
}

/// Canonical reason phrase of `code`, or `"Unknown"`.
pub(crate) fn canonical_reason(code: u16) -> &'static str {
    StatusCode::from_u16(code)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("Unknown")
}

/// Errors that can occur while building or running an upgrade server.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// Zero or several listener modes were configured.
    #[error("One and only one of the \"port\", \"server\", or \"noServer\" options must be specified")]
    ConflictingModes,

    /// The operation needs a listener but the server has none.
    #[error("The server is operating in \"noServer\" mode")]
    NoServerMode,

    /// The server is already closed.
    #[error("The server is not running")]
    NotRunning,

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The owned listener server failed.
    #[error(transparent)]
    Listener(#[from] ListenerError),

    /// No reactor is available.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(HandshakeError::InvalidMethod.status_code(), 405);
        assert_eq!(HandshakeError::InvalidKey.status_code(), 400);
        assert_eq!(HandshakeError::ServerNotRunning.status_code(), 503);
        assert_eq!(HandshakeError::PromotionFailed.status_code(), 500);
        assert_eq!(
            HandshakeError::UnknownSubprotocol("x".into()).status_code(),
            500
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            HandshakeError::InvalidVersion.message(),
            "Missing or invalid Sec-WebSocket-Version header"
        );
        assert_eq!(HandshakeError::PathRejected.message(), "Bad Request");
        assert_eq!(
            HandshakeError::ServerNotRunning.message(),
            "Service Unavailable"
        );
    }

    #[test]
    fn test_rejected_defaults() {
        let error = HandshakeError::Rejected {
            code: 403,
            message: None,
            headers: vec![("Retry-After".into(), "5".into())],
        };
        assert_eq!(error.status_code(), 403);
        assert_eq!(error.message(), "Forbidden");
        assert_eq!(error.headers().len(), 1);
    }

    #[test]
    fn test_unknown_status_reason() {
        assert_eq!(canonical_reason(599), "Unknown");
    }
}
