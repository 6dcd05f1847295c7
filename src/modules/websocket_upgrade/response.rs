//! Handshake responses.

use base64::Engine;
use sha1::{Digest, Sha1};

use super::error::canonical_reason;

/// WebSocket magic GUID for Sec-WebSocket-Accept calculation.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute Sec-WebSocket-Accept value from client key.
#[must_use]
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// The fixed lines that open every successful upgrade response.
#[must_use]
pub fn upgrade_header_lines() -> Vec<String> {
    vec![
        "HTTP/1.1 101 Switching Protocols".to_string(),
        "Upgrade: websocket".to_string(),
        "Connection: Upgrade".to_string(),
    ]
}

/// Serialise a `101 Switching Protocols` response.
///
/// `lines` are the status line and headers collected so far; the accept key
/// and the selected protocol are appended after them.
#[must_use]
pub fn switching_protocols(lines: &[String], key: &str, protocol: Option<&str>) -> Vec<u8> {
    let mut response = lines.join("\r\n");
    response.push_str("\r\nSec-WebSocket-Accept: ");
    response.push_str(&compute_accept_key(key));
    if let Some(protocol) = protocol {
        response.push_str("\r\nSec-WebSocket-Protocol: ");
        response.push_str(protocol);
    }
    response.push_str("\r\n\r\n");
    response.into_bytes()
}

/// Build an abort response.
///
/// `message` defaults to the canonical reason of `code`. The default
/// `Connection`, `Content-Type` and `Content-Length` headers are replaced
/// by caller headers of the same name.
#[must_use]
pub fn abort_response(code: u16, message: Option<&str>, headers: &[(String, String)]) -> Vec<u8> {
    let reason = canonical_reason(code);
    let body = message.unwrap_or(reason);
    let content_length = body.len().to_string();

    let mut merged: Vec<(&str, &str)> = vec![
        ("Connection", "close"),
        ("Content-Type", "text/html"),
        ("Content-Length", content_length.as_str()),
    ];
    for (name, value) in headers {
        match merged
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value.as_str(),
            None => merged.push((name.as_str(), value.as_str())),
        }
    }

    let mut response = format!("HTTP/1.1 {code} {reason}\r\n");
    for (name, value) in merged {
        response.push_str(name);
        response.push_str(": ");
        response.push_str(value);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response.push_str(body);
    response.into_bytes()
}

/// Answer to a plain HTTP request sent to a WebSocket-only endpoint.
#[must_use]
pub fn upgrade_required_response() -> Vec<u8> {
    let body = canonical_reason(426);
    format!(
        "HTTP/1.1 426 {body}\r\n\
         Connection: close\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {body}",
        body.len()
    )
    .into_bytes()
}
