//! The transport contract.
//!
//! A transport is the event-driven byte-stream provider underneath a
//! [`StreamSocket`](crate::modules::stream_socket::StreamSocket). It reports
//! what happens on a connection through [`TransportEvents`] and exposes the
//! handful of operations the socket layer needs through [`Connection`].
//!
//! # Re-entrancy
//!
//! Implementations must never invoke a [`TransportEvents`] or [`Acceptor`]
//! callback synchronously from inside a [`Connection`], [`Listener`] or
//! [`Transport`] method. Events are always delivered from the transport's own
//! reactor turn, which lets the socket layer hold its state lock while it
//! drives the connection.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::TransportResult;
use super::tls::TlsOptions;

/// A raw transport connection handle.
pub trait Connection: Send {
    /// Offers `data` to the transport. Returns the number of bytes accepted,
    /// which may be less than `data.len()` when the send buffer is full.
    /// A fully or partially refused write is followed by a drain event once
    /// the connection can accept more.
    fn write(&mut self, data: &[u8]) -> usize;

    /// Gracefully ends the connection (half-closes the write side).
    fn end(&mut self);

    /// Tears the connection down immediately.
    fn destroy(&mut self);

    /// Sets the idle timeout. `Duration::ZERO` disables it.
    fn set_timeout(&mut self, timeout: Duration);

    /// Keeps (or stops keeping) the reactor alive on behalf of this connection.
    fn set_referenced(&mut self, referenced: bool);

    /// Local address of the connection.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Remote address of the connection.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Promotes this connection to TLS.
    ///
    /// On success returns `(raw, tls)`: the handle that now owns the plain
    /// side of the stream and the handle all further I/O must go through.
    /// Events of the TLS handle are delivered to `events`. Returns `None`
    /// when the connection cannot be upgraded.
    fn upgrade_tls(
        &mut self,
        options: &TlsOptions,
        events: Arc<dyn TransportEvents>,
    ) -> Option<(Box<dyn Connection>, Box<dyn Connection>)>;
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.local_addr())
            .field("remote", &self.remote_addr())
            .finish()
    }
}

/// Callbacks a transport invokes for one connection.
///
/// Callbacks for the same connection are serialised and delivered in
/// arrival order.
pub trait TransportEvents: Send + Sync {
    /// A dialed connection is open.
    fn on_open(&self, connection: Box<dyn Connection>);

    /// A dial attempt failed.
    fn on_connect_error(&self, error: io::Error);

    /// Inbound bytes.
    fn on_data(&self, chunk: Bytes);

    /// The connection can accept more bytes after a refused write.
    fn on_drain(&self);

    /// The peer ended its side of the stream.
    fn on_end(&self);

    /// The connection is closed.
    fn on_close(&self);

    /// An I/O error occurred.
    fn on_error(&self, error: io::Error);

    /// The idle timeout elapsed.
    fn on_timeout(&self);

    /// A TLS handshake finished.
    fn on_handshake(&self, success: bool, verify_error: Option<String>);
}

/// Receives connections accepted by a [`Listener`].
pub trait Acceptor: Send + Sync {
    /// A connection was accepted. Returns the sink for the connection's
    /// subsequent events, or `None` when the acceptor refused it.
    fn on_open(&self, connection: Box<dyn Connection>) -> Option<Arc<dyn TransportEvents>>;

    /// The listener failed.
    fn on_error(&self, error: io::Error);
}

/// A bound listener.
pub trait Listener: Send {
    /// The bound address.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Attaches (or, with `None`, detaches) the accept hook.
    fn set_acceptor(&mut self, acceptor: Option<Arc<dyn Acceptor>>);

    /// Stops accepting. `on_stopped` runs once the listener is closed.
    fn stop(&mut self, on_stopped: Box<dyn FnOnce() + Send>);

    /// Keeps (or stops keeping) the reactor alive on behalf of this listener.
    fn set_referenced(&mut self, referenced: bool);
}

impl fmt::Debug for dyn Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("local", &self.local_addr())
            .finish()
    }
}

/// Factory for listeners and outbound connections.
pub trait Transport: Send + Sync {
    /// Binds a new listener that hands accepted connections to `acceptor`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    fn listen(
        &self,
        options: &ListenOptions,
        acceptor: Arc<dyn Acceptor>,
    ) -> TransportResult<Box<dyn Listener>>;

    /// Dials out. The outcome is reported through `events.on_open` or
    /// `events.on_connect_error`.
    fn connect(&self, options: &ConnectOptions, events: Arc<dyn TransportEvents>);
}

/// Options for binding a listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenOptions {
    /// Host to bind.
    pub host: String,

    /// Port to bind (0 = ephemeral).
    pub port: u16,

    /// Pending-connection queue length.
    #[serde(default)]
    pub backlog: Option<u32>,
}

impl ListenOptions {
    /// Listen on `port` on all interfaces.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port,
            backlog: None,
        }
    }

    /// Set the host to bind.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the backlog.
    #[must_use]
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }
}

/// Options for dialing out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Remote host.
    pub host: String,

    /// Remote port.
    pub port: u16,

    /// Give up dialing after this long.
    pub timeout: Option<Duration>,
}

impl ConnectOptions {
    /// Dial `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: None,
        }
    }
}

/// Address family of a socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4.
    IPv4,
    /// IPv6.
    IPv6,
}

impl AddressFamily {
    /// Family of `addr`.
    #[must_use]
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self::IPv4,
            SocketAddr::V6(_) => Self::IPv6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IPv4 => write!(f, "IPv4"),
            Self::IPv6 => write!(f, "IPv6"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_family() {
        let v4: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert_eq!(AddressFamily::of(&v4), AddressFamily::IPv4);
        assert_eq!(AddressFamily::of(&v6).to_string(), "IPv6");
    }

    #[test]
    fn test_listen_options_builder() {
        let options = ListenOptions::new(8080).host("127.0.0.1").backlog(64);
        assert_eq!(options.host, "127.0.0.1");
        assert_eq!(options.port, 8080);
        assert_eq!(options.backlog, Some(64));
    }
}
