//! Stateless checks for the fields of an upgrade request.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Sec-WebSocket-Key: 16 random bytes, base64 encoded.
static KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+/0-9A-Za-z]{22}==$").unwrap());

/// RFC 7230 `tchar` lookup for 7-bit characters.
const TOKEN_CHARS: [bool; 128] = {
    let mut table = [false; 128];
    let mut c = 0;
    while c < 128 {
        let b = c as u8;
        table[c] = b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'!' | b'#'
                    | b'$'
                    | b'%'
                    | b'&'
                    | b'\''
                    | b'*'
                    | b'+'
                    | b'-'
                    | b'.'
                    | b'^'
                    | b'_'
                    | b'`'
                    | b'|'
                    | b'~'
            );
        c += 1;
    }
    table
};

/// WebSocket protocol versions this server speaks.
pub const SUPPORTED_VERSIONS: [u8; 2] = [8, 13];

/// Whether `byte` is an RFC 7230 token character.
#[must_use]
pub fn is_token_char(byte: u8) -> bool {
    TOKEN_CHARS.get(usize::from(byte)).copied().unwrap_or(false)
}

/// The method must be exactly `GET`.
#[must_use]
pub fn validate_method(method: &str) -> bool {
    method == "GET"
}

/// The `Upgrade` header must be `websocket`, ignoring case.
#[must_use]
pub fn validate_upgrade_header(upgrade: Option<&str>) -> bool {
    upgrade.is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

/// The key must look like 16 base64-encoded bytes.
#[must_use]
pub fn validate_key(key: Option<&str>) -> bool {
    key.is_some_and(|value| KEY_PATTERN.is_match(value))
}

/// Parse `Sec-WebSocket-Version`, accepting only supported versions.
#[must_use]
pub fn parse_version(version: Option<&str>) -> Option<u8> {
    version
        .and_then(|value| value.trim().parse::<u8>().ok())
        .filter(|v| SUPPORTED_VERSIONS.contains(v))
}

/// Why a `Sec-WebSocket-Protocol` header failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubprotocolError {
    /// A character that is neither a token character, padding nor a comma.
    #[error("Unexpected character at index {index}")]
    UnexpectedCharacter {
        /// Byte offset into the header value.
        index: usize,
    },

    /// The same token appears twice.
    #[error("The \"{0}\" subprotocol is duplicated")]
    Duplicate(String),

    /// The header ends without a complete token.
    #[error("Unexpected end of input")]
    UnexpectedEnd,
}

/// Distinct subprotocol tokens in the order the client offered them.
#[derive(Debug, Clone, Default, Eq)]
pub struct SubprotocolSet {
    tokens: Vec<String>,
}

impl SubprotocolSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, token: &str) -> Result<(), SubprotocolError> {
        if self.contains(token) {
            return Err(SubprotocolError::Duplicate(token.to_string()));
        }
        self.tokens.push(token.to_string());
        Ok(())
    }

    /// Whether `token` was offered. Comparison is case-sensitive.
    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }

    /// The first offered token.
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        self.tokens.first().map(String::as_str)
    }

    /// Offered tokens in order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }

    /// Number of tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no token was offered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl PartialEq for SubprotocolSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|t| other.contains(t))
    }
}

impl fmt::Display for SubprotocolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tokens.join(", "))
    }
}

/// Parse a `Sec-WebSocket-Protocol` header value.
///
/// Tokens are separated by commas. Spaces and tabs may pad a token but may
/// not start the value, split a token or trail the last token.
///
/// # Errors
///
/// Returns the first grammar violation found scanning left to right, or
/// [`SubprotocolError::Duplicate`] for a repeated token.
pub fn parse_subprotocols(header: &str) -> Result<SubprotocolSet, SubprotocolError> {
    let bytes = header.as_bytes();
    let mut protocols = SubprotocolSet::new();
    let mut start: Option<usize> = None;
    let mut end: Option<usize> = None;

    for (i, &byte) in bytes.iter().enumerate() {
        if end.is_none() && is_token_char(byte) {
            if start.is_none() {
                start = Some(i);
            }
        } else if i != 0 && (byte == b' ' || byte == b'\t') {
            if end.is_none() && start.is_some() {
                end = Some(i);
            }
        } else if byte == b',' {
            let Some(token_start) = start else {
                return Err(SubprotocolError::UnexpectedCharacter { index: i });
            };
            let token_end = end.unwrap_or(i);
            protocols.insert(&header[token_start..token_end])?;
            start = None;
            end = None;
        } else {
            return Err(SubprotocolError::UnexpectedCharacter { index: i });
        }
    }

    match (start, end) {
        (Some(token_start), None) => {
            protocols.insert(&header[token_start..])?;
            Ok(protocols)
        },
        _ => Err(SubprotocolError::UnexpectedEnd),
    }
}
