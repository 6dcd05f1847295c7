//! In-memory transport.
//!
//! Connections live entirely in process memory. Every connection has a
//! [`MemoryConnectionHandle`] that plays the peer: it inspects what the
//! socket layer wrote and injects transport events (data, drain, end,
//! close, errors, TLS handshake results) from the caller's frame.
//!
//! Writes are accepted up to a configurable budget, which makes partial
//! writes and backpressure reproducible without a kernel socket.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use super::contract::{
    Acceptor, ConnectOptions, Connection, ListenOptions, Listener, Transport, TransportEvents,
};
use super::error::{TransportError, TransportResult};
use super::lock;
use super::reactor::Reactor;
use super::tls::TlsOptions;

/// First port handed out for `port = 0` listeners and dialing clients.
const EPHEMERAL_PORT_BASE: u16 = 49152;

#[derive(Default)]
struct ConnectionState {
    written: Vec<u8>,
    write_budget: Option<usize>,
    write_refused: bool,
    ended: bool,
    destroyed: bool,
    referenced: bool,
    timeout: Duration,
    tls_allowed: bool,
    tls: Option<MemoryConnectionHandle>,
    events: Option<Arc<dyn TransportEvents>>,
}

/// One end of an in-memory connection, owned by the socket layer.
pub struct MemoryConnection {
    state: Arc<Mutex<ConnectionState>>,
    local: SocketAddr,
    remote: SocketAddr,
}

impl MemoryConnection {
    /// A new connection and the handle that drives its peer side.
    #[must_use]
    pub fn pair(local: SocketAddr, remote: SocketAddr) -> (Self, MemoryConnectionHandle) {
        let state = Arc::new(Mutex::new(ConnectionState {
            referenced: true,
            tls_allowed: true,
            ..ConnectionState::default()
        }));
        let handle = MemoryConnectionHandle {
            state: Arc::clone(&state),
            local,
            remote,
        };
        (
            Self {
                state,
                local,
                remote,
            },
            handle,
        )
    }
}

impl Connection for MemoryConnection {
    fn write(&mut self, data: &[u8]) -> usize {
        let mut state = lock(&self.state);
        if state.destroyed || state.ended {
            return 0;
        }

        let accepted = match state.write_budget {
            Some(budget) => budget.min(data.len()),
            None => data.len(),
        };
        if let Some(budget) = state.write_budget.as_mut() {
            *budget -= accepted;
        }
        state.written.extend_from_slice(&data[..accepted]);
        if accepted < data.len() {
            state.write_refused = true;
        }

        trace!(offered = data.len(), accepted, "Memory connection write");
        accepted
    }

    fn end(&mut self) {
        lock(&self.state).ended = true;
    }

    fn destroy(&mut self) {
        lock(&self.state).destroyed = true;
    }

    fn set_timeout(&mut self, timeout: Duration) {
        lock(&self.state).timeout = timeout;
    }

    fn set_referenced(&mut self, referenced: bool) {
        lock(&self.state).referenced = referenced;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    fn upgrade_tls(
        &mut self,
        options: &TlsOptions,
        events: Arc<dyn TransportEvents>,
    ) -> Option<(Box<dyn Connection>, Box<dyn Connection>)> {
        let mut state = lock(&self.state);
        if !state.tls_allowed || state.destroyed {
            debug!("Memory connection refused TLS upgrade");
            return None;
        }

        let (tls, tls_handle) = MemoryConnection::pair(self.local, self.remote);
        lock(&tls_handle.state).events = Some(events);
        state.tls = Some(tls_handle);
        drop(state);

        debug!(client = options.is_client(), "Memory connection upgraded to TLS");

        let raw = MemoryConnection {
            state: Arc::clone(&self.state),
            local: self.local,
            remote: self.remote,
        };
        Some((Box::new(raw), Box::new(tls)))
    }
}

/// Peer-side view of a [`MemoryConnection`].
///
/// Event injection runs the callbacks on the caller's frame, so it must not
/// be used from inside a socket callback.
#[derive(Clone)]
pub struct MemoryConnectionHandle {
    state: Arc<Mutex<ConnectionState>>,
    local: SocketAddr,
    remote: SocketAddr,
}

impl std::fmt::Debug for MemoryConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnectionHandle")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}

impl MemoryConnectionHandle {
    /// Address of the socket side.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Address of the peer side.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Register the sink that receives injected events.
    pub fn set_events(&self, events: Arc<dyn TransportEvents>) {
        lock(&self.state).events = Some(events);
    }

    /// Limit how many more bytes writes accept. `None` removes the limit.
    pub fn set_write_budget(&self, budget: Option<usize>) {
        lock(&self.state).write_budget = budget;
    }

    /// Allow `bytes` more to be written and report a drain if a previous
    /// write was refused.
    pub fn grant(&self, bytes: usize) {
        let events = {
            let mut state = lock(&self.state);
            state.write_budget = Some(state.write_budget.unwrap_or(0) + bytes);
            if std::mem::take(&mut state.write_refused) {
                state.events.clone()
            } else {
                None
            }
        };
        if let Some(events) = events {
            events.on_drain();
        }
    }

    /// Make future TLS upgrades fail.
    pub fn refuse_tls(&self) {
        lock(&self.state).tls_allowed = false;
    }

    /// Everything written so far.
    #[must_use]
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    /// Everything written so far, as text.
    #[must_use]
    pub fn written_string(&self) -> String {
        String::from_utf8_lossy(&lock(&self.state).written).into_owned()
    }

    /// Whether the socket side half-closed the connection.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        lock(&self.state).ended
    }

    /// Whether the socket side destroyed the connection.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        lock(&self.state).destroyed
    }

    /// Whether the connection keeps the reactor alive.
    #[must_use]
    pub fn is_referenced(&self) -> bool {
        lock(&self.state).referenced
    }

    /// Idle timeout last set by the socket side.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        lock(&self.state).timeout
    }

    /// The TLS side created by a successful upgrade.
    #[must_use]
    pub fn tls(&self) -> Option<MemoryConnectionHandle> {
        lock(&self.state).tls.clone()
    }

    fn events(&self) -> Option<Arc<dyn TransportEvents>> {
        lock(&self.state).events.clone()
    }

    /// Deliver inbound bytes.
    pub fn push_data(&self, data: impl Into<Bytes>) {
        if let Some(events) = self.events() {
            events.on_data(data.into());
        }
    }

    /// Report that the peer ended its side.
    pub fn push_end(&self) {
        if let Some(events) = self.events() {
            events.on_end();
        }
    }

    /// Report that the connection closed.
    pub fn push_close(&self) {
        if let Some(events) = self.events() {
            events.on_close();
        }
    }

    /// Report an I/O error.
    pub fn push_error(&self, error: io::Error) {
        if let Some(events) = self.events() {
            events.on_error(error);
        }
    }

    /// Report an idle timeout.
    pub fn push_timeout(&self) {
        if let Some(events) = self.events() {
            events.on_timeout();
        }
    }

    /// Report a finished TLS handshake.
    pub fn push_handshake(&self, success: bool, verify_error: Option<String>) {
        if let Some(events) = self.events() {
            events.on_handshake(success, verify_error);
        }
    }
}

#[derive(Default)]
struct ListenerState {
    acceptor: Option<Arc<dyn Acceptor>>,
    stopped: bool,
    referenced: bool,
    next_peer_port: u16,
}

/// An in-memory listener.
pub struct MemoryListener {
    state: Arc<Mutex<ListenerState>>,
    local: SocketAddr,
    reactor: Reactor,
}

impl Listener for MemoryListener {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn set_acceptor(&mut self, acceptor: Option<Arc<dyn Acceptor>>) {
        lock(&self.state).acceptor = acceptor;
    }

    fn stop(&mut self, on_stopped: Box<dyn FnOnce() + Send>) {
        {
            let mut state = lock(&self.state);
            state.stopped = true;
            state.acceptor = None;
        }
        debug!(address = %self.local, "Memory listener stopped");
        self.reactor.defer(on_stopped);
    }

    fn set_referenced(&mut self, referenced: bool) {
        lock(&self.state).referenced = referenced;
    }
}

/// Peer-side view of a [`MemoryListener`].
#[derive(Clone)]
pub struct MemoryListenerHandle {
    state: Arc<Mutex<ListenerState>>,
    local: SocketAddr,
}

impl std::fmt::Debug for MemoryListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryListenerHandle")
            .field("local", &self.local)
            .finish()
    }
}

impl MemoryListenerHandle {
    /// The bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Whether the listener was stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        lock(&self.state).stopped
    }

    /// Whether an acceptor is attached.
    #[must_use]
    pub fn has_acceptor(&self) -> bool {
        lock(&self.state).acceptor.is_some()
    }

    /// Simulate an inbound connection. Returns the peer handle, or `None`
    /// when the listener is stopped or has no acceptor.
    #[must_use]
    pub fn connect(&self) -> Option<MemoryConnectionHandle> {
        let (acceptor, remote) = {
            let mut state = lock(&self.state);
            if state.stopped {
                return None;
            }
            let acceptor = state.acceptor.clone()?;
            state.next_peer_port = state.next_peer_port.wrapping_add(1);
            let port = EPHEMERAL_PORT_BASE.wrapping_add(state.next_peer_port);
            (acceptor, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
        };

        let (connection, handle) = MemoryConnection::pair(self.local, remote);
        if let Some(events) = acceptor.on_open(Box::new(connection)) {
            handle.set_events(events);
        }
        Some(handle)
    }

    /// Report a listener failure to the acceptor.
    pub fn push_error(&self, error: io::Error) {
        let acceptor = lock(&self.state).acceptor.clone();
        if let Some(acceptor) = acceptor {
            acceptor.on_error(error);
        }
    }
}

/// A transport whose listeners and connections live in memory.
pub struct MemoryTransport {
    reactor: Reactor,
    next_port: AtomicU16,
    refuse_connect: AtomicBool,
    listeners: Mutex<Vec<MemoryListenerHandle>>,
    dialed: Mutex<Vec<MemoryConnectionHandle>>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("listeners", &lock(&self.listeners).len())
            .field("dialed", &lock(&self.dialed).len())
            .finish()
    }
}

impl MemoryTransport {
    /// A transport scheduling on `reactor`.
    #[must_use]
    pub fn new(reactor: Reactor) -> Self {
        Self {
            reactor,
            next_port: AtomicU16::new(EPHEMERAL_PORT_BASE),
            refuse_connect: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            dialed: Mutex::new(Vec::new()),
        }
    }

    /// Make future dial attempts fail with `ConnectionRefused`.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// The most recently bound listener.
    #[must_use]
    pub fn last_listener(&self) -> Option<MemoryListenerHandle> {
        lock(&self.listeners).last().cloned()
    }

    /// The most recently dialed connection.
    #[must_use]
    pub fn last_dialed(&self) -> Option<MemoryConnectionHandle> {
        lock(&self.dialed).last().cloned()
    }

    fn resolve(host: &str, port: u16) -> TransportResult<SocketAddr> {
        let ip = match host {
            "localhost" => IpAddr::V4(Ipv4Addr::LOCALHOST),
            other => other.parse().map_err(|_| TransportError::InvalidAddress {
                address: format!("{host}:{port}"),
            })?,
        };
        Ok(SocketAddr::new(ip, port))
    }
}

impl Transport for MemoryTransport {
    fn listen(
        &self,
        options: &ListenOptions,
        acceptor: Arc<dyn Acceptor>,
    ) -> TransportResult<Box<dyn Listener>> {
        let port = if options.port == 0 {
            self.next_port.fetch_add(1, Ordering::SeqCst)
        } else {
            options.port
        };
        let local = Self::resolve(&options.host, port)?;

        let state = Arc::new(Mutex::new(ListenerState {
            acceptor: Some(acceptor),
            referenced: true,
            ..ListenerState::default()
        }));
        lock(&self.listeners).push(MemoryListenerHandle {
            state: Arc::clone(&state),
            local,
        });

        debug!(address = %local, "Memory listener bound");
        Ok(Box::new(MemoryListener {
            state,
            local,
            reactor: self.reactor.clone(),
        }))
    }

    fn connect(&self, options: &ConnectOptions, events: Arc<dyn TransportEvents>) {
        if self.refuse_connect.load(Ordering::SeqCst) {
            self.reactor.defer(move || {
                events.on_connect_error(io::Error::from(io::ErrorKind::ConnectionRefused));
            });
            return;
        }

        let remote = match Self::resolve(&options.host, options.port) {
            Ok(remote) => remote,
            Err(e) => {
                let message = e.to_string();
                self.reactor.defer(move || {
                    events.on_connect_error(io::Error::new(io::ErrorKind::InvalidInput, message));
                });
                return;
            },
        };
        let local = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            self.next_port.fetch_add(1, Ordering::SeqCst),
        );

        let (connection, handle) = MemoryConnection::pair(local, remote);
        handle.set_events(Arc::clone(&events));
        lock(&self.dialed).push(handle);

        self.reactor.defer(move || events.on_open(Box::new(connection)));
    }
}
