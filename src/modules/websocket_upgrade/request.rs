//! The upgrade request as seen by the handshake.

use http::header::{HeaderName, HeaderValue, CONNECTION, ORIGIN, UPGRADE};
use http::HeaderMap;
use thiserror::Error;
use tracing::warn;

/// `Sec-WebSocket-Key`.
pub const SEC_WEBSOCKET_KEY: &str = "sec-websocket-key";
/// `Sec-WebSocket-Version`.
pub const SEC_WEBSOCKET_VERSION: &str = "sec-websocket-version";
/// `Sec-WebSocket-Protocol`.
pub const SEC_WEBSOCKET_PROTOCOL: &str = "sec-websocket-protocol";
/// `Sec-WebSocket-Origin`, the origin header of protocol version 8.
pub const SEC_WEBSOCKET_ORIGIN: &str = "sec-websocket-origin";

/// Why a request head could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestParseError {
    /// The head is not valid UTF-8.
    #[error("request head is not valid UTF-8")]
    InvalidUtf8,

    /// The request line is missing or malformed.
    #[error("invalid request line")]
    InvalidRequestLine,

    /// A header line has no colon or an invalid name or value.
    #[error("invalid header line: {0}")]
    InvalidHeader(String),
}

/// An HTTP request asking to switch protocols.
///
/// Header names are case-insensitive. Nothing is validated here; the
/// upgrade server decides what is acceptable.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Request method.
    pub method: String,

    /// Request target, including any query.
    pub url: String,

    /// Request headers.
    pub headers: HeaderMap,

    /// Whether the request arrived over TLS.
    pub secure: bool,
}

impl UpgradeRequest {
    /// A request with no headers.
    #[must_use]
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: HeaderMap::new(),
            secure: false,
        }
    }

    /// Append a header. Invalid names or values are logged and skipped.
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            },
            _ => warn!(name, "Skipping invalid request header"),
        }
        self
    }

    /// Mark the request as received over TLS.
    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// First value of header `name` as text.
    #[must_use]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Path of the request target with any query removed.
    #[must_use]
    pub fn path(&self) -> &str {
        self.url.split_once('?').map_or(self.url.as_str(), |(path, _)| path)
    }

    /// `Sec-WebSocket-Key`.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.header_value(SEC_WEBSOCKET_KEY)
    }

    /// `Sec-WebSocket-Version`.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.header_value(SEC_WEBSOCKET_VERSION)
    }

    /// Raw `Sec-WebSocket-Protocol`.
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.header_value(SEC_WEBSOCKET_PROTOCOL)
    }

    /// `Upgrade`.
    #[must_use]
    pub fn upgrade(&self) -> Option<&str> {
        self.header_value(UPGRADE.as_str())
    }

    /// Origin of the client. Version 8 clients send `Sec-WebSocket-Origin`.
    #[must_use]
    pub fn origin(&self, version: u8) -> Option<&str> {
        if version == 8 {
            self.header_value(SEC_WEBSOCKET_ORIGIN)
        } else {
            self.header_value(ORIGIN.as_str())
        }
    }

    /// Whether the request asks for a protocol switch at all: an `Upgrade`
    /// header and a `Connection` header listing `upgrade`.
    #[must_use]
    pub fn is_upgrade(&self) -> bool {
        let connection = self
            .headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
        connection && self.headers.contains_key(UPGRADE)
    }

    /// Parse a request head (request line and headers, with or without the
    /// terminating blank line).
    ///
    /// # Errors
    ///
    /// Returns an error if the head is not UTF-8, the request line is not
    /// `METHOD TARGET VERSION`, or a header line is malformed.
    pub fn parse(head: &[u8]) -> Result<Self, RequestParseError> {
        let text = std::str::from_utf8(head).map_err(|_| RequestParseError::InvalidUtf8)?;
        let mut lines = text.lines();

        let request_line = lines.next().ok_or(RequestParseError::InvalidRequestLine)?;
        let parts: Vec<&str> = request_line.split_whitespace().collect();
        let [method, url, version] = parts.as_slice() else {
            return Err(RequestParseError::InvalidRequestLine);
        };
        if !version.starts_with("HTTP/") {
            return Err(RequestParseError::InvalidRequestLine);
        }

        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(RequestParseError::InvalidHeader(line.to_string()));
            };
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|_| RequestParseError::InvalidHeader(line.to_string()))?;
            let value = HeaderValue::from_str(value.trim())
                .map_err(|_| RequestParseError::InvalidHeader(line.to_string()))?;
            headers.append(name, value);
        }

        Ok(Self {
            method: (*method).to_string(),
            url: (*url).to_string(),
            headers,
            secure: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAD: &[u8] = b"GET /chat?room=1 HTTP/1.1\r\n\
                          Host: example.com\r\n\
                          Upgrade: websocket\r\n\
                          Connection: keep-alive, Upgrade\r\n\
                          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                          Sec-WebSocket-Version: 13\r\n\
                          Sec-WebSocket-Protocol: chat, superchat\r\n\
                          Origin: http://example.com\r\n\
                          \r\n";

    #[test]
    fn test_parse_upgrade_request() {
        let request = UpgradeRequest::parse(HEAD).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.url, "/chat?room=1");
        assert_eq!(request.path(), "/chat");
        assert_eq!(request.key(), Some("dGhlIHNhbXBsZSBub25jZQ=="));
        assert_eq!(request.version(), Some("13"));
        assert_eq!(request.protocol(), Some("chat, superchat"));
        assert_eq!(request.upgrade(), Some("websocket"));
        assert_eq!(request.origin(13), Some("http://example.com"));
        assert!(request.is_upgrade());
        assert!(!request.secure);
    }

    #[test]
    fn test_origin_for_version_8() {
        let request = UpgradeRequest::new("GET", "/")
            .header("Origin", "http://a.example")
            .header("Sec-WebSocket-Origin", "http://b.example");
        assert_eq!(request.origin(8), Some("http://b.example"));
        assert_eq!(request.origin(13), Some("http://a.example"));
    }

    #[test]
    fn test_plain_request_is_not_upgrade() {
        let request =
            UpgradeRequest::parse(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
        assert!(!request.is_upgrade());
    }

    #[test]
    fn test_parse_invalid_request_line() {
        assert_eq!(
            UpgradeRequest::parse(b"GET /\r\n\r\n").unwrap_err(),
            RequestParseError::InvalidRequestLine
        );
        assert_eq!(
            UpgradeRequest::parse(b"GET / FTP/1.0\r\n\r\n").unwrap_err(),
            RequestParseError::InvalidRequestLine
        );
    }

    #[test]
    fn test_parse_invalid_header() {
        assert!(matches!(
            UpgradeRequest::parse(b"GET / HTTP/1.1\r\nno colon here\r\n\r\n"),
            Err(RequestParseError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_builder_skips_invalid_header() {
        let request = UpgradeRequest::new("GET", "/").header("bad name", "x");
        assert!(request.headers.is_empty());
    }
}
