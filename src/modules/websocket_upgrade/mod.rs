//! WebSocket upgrade handshake (RFC 6455 section 4).
//!
//! [`UpgradeServer`] validates an HTTP upgrade request, runs the optional
//! client verification hook and promotes the connection through an
//! [`UpgradeExchange`]. In port and server modes a built-in driver reads
//! the request head from each accepted [`StreamSocket`](crate::modules::stream_socket::StreamSocket);
//! in no-server mode requests are handed in with
//! [`UpgradeServer::handle_upgrade`].
//!
//! Message framing after the switch is not part of this module: promoted
//! connections are handed over as [`WebSocketClient`] handles.

mod client;
mod config;
mod error;
mod exchange;
mod request;
mod response;
mod server;
mod validator;
mod verify;

pub use client::{ClientOptions, WebSocketClient};
pub use config::{
    DeflateOptions, PerMessageDeflate, UpgradeServerConfig, DEFAULT_MAX_HANDSHAKE_SIZE,
    DEFAULT_MAX_PAYLOAD,
};
pub use error::{HandshakeError, HandshakeResult, UpgradeError, UpgradeResult};
pub use exchange::{Promotion, SocketExchange, UpgradeExchange};
pub use request::{
    RequestParseError, UpgradeRequest, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_ORIGIN,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION,
};
pub use response::{
    abort_response, compute_accept_key, switching_protocols, upgrade_header_lines,
    upgrade_required_response,
};
pub use server::{
    ClientErrorHook, HeadersHook, PathFilter, ProtocolSelector, ServerMode, UpgradeEvent,
    UpgradeServer, UpgradeServerBuilder, UpgradeState,
};
pub use validator::{
    is_token_char, parse_subprotocols, parse_version, validate_key, validate_method,
    validate_upgrade_header, SubprotocolError, SubprotocolSet, SUPPORTED_VERSIONS,
};
pub use verify::{AsyncVerifier, ClientInfo, SyncVerifier, Verdict, VerifyClient, VerifyResponder};
