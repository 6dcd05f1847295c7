//! TCP transport on tokio.
//!
//! Every connection gets one driver task that owns its readiness loop: it
//! reads, flushes TLS records, reports drains once a refused write can
//! proceed, fires the idle timer, and delivers the final close. Because all
//! events of a connection come from that single task they are serialised.
//!
//! Writes never wait: [`Connection::write`] hands bytes to the kernel with
//! `try_write` and returns how many were taken.

use std::io;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use super::contract::{
    Acceptor, ConnectOptions, Connection, ListenOptions, Listener, Transport, TransportEvents,
};
use super::error::{TransportError, TransportResult};
use super::lock;
use super::reactor::Reactor;
use super::tls::{TlsFailure, TlsOptions, TlsSession};

/// Default pending-connection queue length.
const DEFAULT_BACKLOG: u32 = 511;

/// Size of the per-connection read buffer.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// TCP transport.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    reactor: Reactor,
}

impl TcpTransport {
    /// A transport spawning its tasks on `reactor`.
    #[must_use]
    pub fn new(reactor: Reactor) -> Self {
        Self { reactor }
    }

    fn resolve(host: &str, port: u16) -> TransportResult<SocketAddr> {
        (host, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| TransportError::InvalidAddress {
                address: format!("{host}:{port}"),
            })
    }

    fn bind(address: SocketAddr, backlog: u32) -> TransportResult<std::net::TcpListener> {
        let bind_error = |source| TransportError::BindError { address, source };

        let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_error)?;
        socket.set_reuse_address(true).map_err(bind_error)?;
        socket.set_nonblocking(true).map_err(bind_error)?;
        socket.bind(&address.into()).map_err(bind_error)?;
        socket
            .listen(i32::try_from(backlog).unwrap_or(i32::MAX))
            .map_err(bind_error)?;

        Ok(socket.into())
    }
}

impl Transport for TcpTransport {
    fn listen(
        &self,
        options: &ListenOptions,
        acceptor: Arc<dyn Acceptor>,
    ) -> TransportResult<Box<dyn Listener>> {
        let address = Self::resolve(&options.host, options.port)?;
        let std_listener = Self::bind(address, options.backlog.unwrap_or(DEFAULT_BACKLOG))?;

        let _guard = self.reactor.handle().enter();
        let listener = TokioTcpListener::from_std(std_listener)?;
        let local = listener.local_addr()?;

        let acceptor_slot = Arc::new(Mutex::new(Some(acceptor)));
        let (stop_tx, stop_rx) = oneshot::channel();

        self.reactor.handle().spawn(accept_loop(
            listener,
            Arc::clone(&acceptor_slot),
            stop_rx,
            self.reactor.clone(),
        ));

        info!(address = %local, "TCP listener bound");

        Ok(Box::new(TcpListenerHandle {
            local,
            acceptor: acceptor_slot,
            stop: Some(stop_tx),
            reactor: self.reactor.clone(),
            referenced: true,
        }))
    }

    fn connect(&self, options: &ConnectOptions, events: Arc<dyn TransportEvents>) {
        let host = options.host.clone();
        let port = options.port;
        let dial_timeout = options.timeout;
        let reactor = self.reactor.clone();

        self.reactor.handle().spawn(async move {
            let dial = TcpStream::connect((host.as_str(), port));
            let result = match dial_timeout {
                Some(limit) => tokio::time::timeout(limit, dial)
                    .await
                    .unwrap_or_else(|_| Err(io::Error::from(io::ErrorKind::TimedOut))),
                None => dial.await,
            };

            match result {
                Ok(stream) => {
                    debug!(host = %host, port, "TCP connection established");
                    let connection = TcpConnection::new(stream);
                    let shared = Arc::clone(&connection.shared);
                    lock(&shared.state).events = Some(Arc::clone(&events));
                    events.on_open(Box::new(connection));
                    reactor.handle().spawn(drive(shared));
                },
                Err(e) => {
                    debug!(host = %host, port, error = %e, "TCP connect failed");
                    events.on_connect_error(e);
                },
            }
        });
    }
}

async fn accept_loop(
    listener: TokioTcpListener,
    acceptor: Arc<Mutex<Option<Arc<dyn Acceptor>>>>,
    mut stop: oneshot::Receiver<Box<dyn FnOnce() + Send>>,
    reactor: Reactor,
) {
    loop {
        tokio::select! {
            stopped = &mut stop => {
                drop(listener);
                info!("Accept loop stopped");
                if let Ok(on_stopped) = stopped {
                    on_stopped();
                }
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let current = lock(&acceptor).clone();
                    let Some(current) = current else {
                        trace!(peer = %peer, "No acceptor attached, dropping connection");
                        continue;
                    };

                    let connection = TcpConnection::new(stream);
                    let shared = Arc::clone(&connection.shared);
                    if let Some(events) = current.on_open(Box::new(connection)) {
                        lock(&shared.state).events = Some(events);
                        reactor.handle().spawn(drive(shared));
                    }
                },
                Err(e) => {
                    let current = lock(&acceptor).clone();
                    if is_fatal_accept_error(&e) {
                        error!(error = %e, "Fatal accept error");
                        if let Some(current) = current {
                            current.on_error(e);
                        }
                        return;
                    }
                    warn!(error = %e, "Transient accept error");
                    if let Some(current) = current {
                        current.on_error(e);
                    }
                },
            }
        }
    }
}

/// Check if an accept error is fatal (unrecoverable).
fn is_fatal_accept_error(error: &io::Error) -> bool {
    use io::ErrorKind;

    matches!(
        error.kind(),
        ErrorKind::InvalidInput | ErrorKind::InvalidData | ErrorKind::NotFound
    )
}

struct TcpListenerHandle {
    local: SocketAddr,
    acceptor: Arc<Mutex<Option<Arc<dyn Acceptor>>>>,
    stop: Option<oneshot::Sender<Box<dyn FnOnce() + Send>>>,
    reactor: Reactor,
    referenced: bool,
}

impl Listener for TcpListenerHandle {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn set_acceptor(&mut self, acceptor: Option<Arc<dyn Acceptor>>) {
        *lock(&self.acceptor) = acceptor;
    }

    fn stop(&mut self, on_stopped: Box<dyn FnOnce() + Send>) {
        *lock(&self.acceptor) = None;
        match self.stop.take() {
            Some(stop) => {
                if let Err(on_stopped) = stop.send(on_stopped) {
                    self.reactor.defer(on_stopped);
                }
            },
            None => self.reactor.defer(on_stopped),
        }
    }

    fn set_referenced(&mut self, referenced: bool) {
        // Tokio tasks keep no per-handle reference on the runtime.
        self.referenced = referenced;
        trace!(address = %self.local, referenced, "Listener reference changed");
    }
}

/// What a handle controls after a TLS upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Plain,
    Tls,
    Superseded,
}

struct ConnState {
    events: Option<Arc<dyn TransportEvents>>,
    tls: Option<TlsSession>,
    tls_ready: bool,
    write_blocked: bool,
    write_closed: bool,
    destroyed: bool,
    pending_error: Option<io::Error>,
    timeout: Duration,
    last_activity: Instant,
    referenced: bool,
}

struct Shared {
    stream: TcpStream,
    state: Mutex<ConnState>,
    notify: Notify,
}

/// Non-blocking writer over the shared stream.
struct StreamWriter<'a>(&'a TcpStream);

impl io::Write for StreamWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A TCP connection handle.
pub struct TcpConnection {
    shared: Arc<Shared>,
    role: Role,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

impl TcpConnection {
    fn new(stream: TcpStream) -> Self {
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "Failed to set TCP_NODELAY");
        }

        Self {
            shared: Arc::new(Shared {
                stream,
                state: Mutex::new(ConnState {
                    events: None,
                    tls: None,
                    tls_ready: false,
                    write_blocked: false,
                    write_closed: false,
                    destroyed: false,
                    pending_error: None,
                    timeout: Duration::ZERO,
                    last_activity: Instant::now(),
                    referenced: true,
                }),
                notify: Notify::new(),
            }),
            role: Role::Plain,
            local,
            remote,
        }
    }

    fn is_active(&self) -> bool {
        self.role != Role::Superseded
    }
}

impl Connection for TcpConnection {
    fn write(&mut self, data: &[u8]) -> usize {
        if !self.is_active() {
            return 0;
        }

        let mut guard = lock(&self.shared.state);
        let state = &mut *guard;
        if state.destroyed || state.write_closed || state.write_blocked {
            return 0;
        }

        let accepted = match state.tls.as_mut() {
            Some(session) => {
                let accepted = session.write_plaintext(data);
                if let Err(e) = session.flush(&mut StreamWriter(&self.shared.stream)) {
                    state.pending_error = Some(e);
                }
                accepted
            },
            None => match self.shared.stream.try_write(data) {
                Ok(written) => written,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                Err(e) => {
                    state.pending_error = Some(e);
                    0
                },
            },
        };

        if accepted < data.len() {
            state.write_blocked = true;
        }
        if accepted > 0 {
            state.last_activity = Instant::now();
        }
        drop(guard);

        trace!(offered = data.len(), accepted, "TCP write");
        self.shared.notify.notify_one();
        accepted
    }

    fn end(&mut self) {
        if !self.is_active() {
            return;
        }

        let mut state = lock(&self.shared.state);
        if state.write_closed || state.destroyed {
            return;
        }
        state.write_closed = true;
        if let Some(session) = state.tls.as_mut() {
            session.send_close_notify();
            let _ = session.flush(&mut StreamWriter(&self.shared.stream));
        }
        drop(state);

        if let Err(e) = SockRef::from(&self.shared.stream).shutdown(Shutdown::Write) {
            trace!(error = %e, "Write half-close failed");
        }
        self.shared.notify.notify_one();
    }

    fn destroy(&mut self) {
        if !self.is_active() {
            return;
        }

        {
            let mut state = lock(&self.shared.state);
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }

        let _ = SockRef::from(&self.shared.stream).shutdown(Shutdown::Both);
        self.shared.notify.notify_one();
    }

    fn set_timeout(&mut self, timeout: Duration) {
        if !self.is_active() {
            return;
        }

        {
            let mut state = lock(&self.shared.state);
            state.timeout = timeout;
            state.last_activity = Instant::now();
        }
        self.shared.notify.notify_one();
    }

    fn set_referenced(&mut self, referenced: bool) {
        if !self.is_active() {
            return;
        }
        lock(&self.shared.state).referenced = referenced;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn upgrade_tls(
        &mut self,
        options: &TlsOptions,
        events: Arc<dyn TransportEvents>,
    ) -> Option<(Box<dyn Connection>, Box<dyn Connection>)> {
        if self.role != Role::Plain {
            return None;
        }

        let session = match TlsSession::new(options) {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Failed to create TLS session");
                return None;
            },
        };

        {
            let mut state = lock(&self.shared.state);
            if state.destroyed || state.write_closed {
                return None;
            }
            state.tls = Some(session);
            state.tls_ready = false;
            state.events = Some(events);
        }
        self.role = Role::Superseded;
        self.shared.notify.notify_one();

        debug!(remote = ?self.remote, client = options.is_client(), "TCP connection upgraded to TLS");

        let handle = |role| TcpConnection {
            shared: Arc::clone(&self.shared),
            role,
            local: self.local,
            remote: self.remote,
        };
        Some((Box::new(handle(Role::Superseded)), Box::new(handle(Role::Tls))))
    }
}

/// Events collected under the state lock and delivered after it is released.
enum Emit {
    Data(Bytes),
    Handshake(bool, Option<String>),
    End,
    Drain,
    Timeout,
    Error(io::Error),
}

impl Shared {
    fn events(&self) -> Option<Arc<dyn TransportEvents>> {
        lock(&self.state).events.clone()
    }

    fn emit(&self, emits: Vec<Emit>) {
        let Some(events) = self.events() else {
            return;
        };
        for emit in emits {
            match emit {
                Emit::Data(chunk) => events.on_data(chunk),
                Emit::Handshake(success, verify_error) => events.on_handshake(success, verify_error),
                Emit::End => events.on_end(),
                Emit::Drain => events.on_drain(),
                Emit::Timeout => events.on_timeout(),
                Emit::Error(e) => events.on_error(e),
            }
        }
    }

    /// Process inbound bytes. Returns `false` when the connection is dead.
    fn receive(&self, data: &[u8], read_open: &mut bool, emits: &mut Vec<Emit>) -> bool {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        state.last_activity = Instant::now();

        let Some(session) = state.tls.as_mut() else {
            emits.push(Emit::Data(Bytes::copy_from_slice(data)));
            return true;
        };

        match session.receive(data) {
            Ok(input) => {
                if let Err(e) = session.flush(&mut StreamWriter(&self.stream)) {
                    emits.push(Emit::Error(e));
                    return false;
                }
                if input.handshake_completed {
                    state.tls_ready = true;
                    emits.push(Emit::Handshake(true, None));
                }
                emits.extend(input.plaintext.into_iter().map(Emit::Data));
                if input.peer_closed {
                    *read_open = false;
                    emits.push(Emit::End);
                }
                true
            },
            Err(TlsFailure::Verification(message)) => {
                emits.push(Emit::Handshake(false, Some(message)));
                false
            },
            Err(TlsFailure::Protocol(message)) => {
                if state.tls_ready {
                    emits.push(Emit::Error(io::Error::new(io::ErrorKind::InvalidData, message)));
                } else {
                    debug!(error = %message, "TLS handshake failed");
                    emits.push(Emit::Handshake(false, None));
                }
                false
            },
        }
    }

    /// Flush TLS records and report a drain once refused writes can proceed.
    fn on_writable(&self, emits: &mut Vec<Emit>) -> bool {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let flushed = match state.tls.as_mut() {
            Some(session) => match session.flush(&mut StreamWriter(&self.stream)) {
                Ok(flushed) => flushed,
                Err(e) => {
                    emits.push(Emit::Error(e));
                    return false;
                },
            },
            None => true,
        };

        let writable = state.tls.is_none() || state.tls_ready;
        if state.write_blocked && writable && flushed {
            state.write_blocked = false;
            emits.push(Emit::Drain);
        }
        true
    }
}

async fn drive(shared: Arc<Shared>) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut read_open = true;

    loop {
        let mut emits = Vec::new();
        let (wants_flush, wants_drain, deadline, finished) = {
            let mut state = lock(&shared.state);
            if let Some(e) = state.pending_error.take() {
                emits.push(Emit::Error(e));
            }
            let wants_flush = state.tls.as_ref().is_some_and(TlsSession::wants_write);
            let wants_drain = state.write_blocked && (state.tls.is_none() || state.tls_ready);
            let deadline = (!state.timeout.is_zero()).then(|| state.last_activity + state.timeout);
            let finished = state.destroyed || (!read_open && state.write_closed);
            (wants_flush, wants_drain, deadline, finished)
        };

        let failed = emits.iter().any(|emit| matches!(emit, Emit::Error(_)));
        shared.emit(emits);
        if finished || failed {
            break;
        }

        let idle = async {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        let mut emits = Vec::new();
        let alive = tokio::select! {
            () = shared.notify.notified() => true,
            ready = shared.stream.readable(), if read_open => match ready {
                Ok(()) => match shared.stream.try_read(&mut buffer) {
                    Ok(0) => {
                        read_open = false;
                        emits.push(Emit::End);
                        true
                    },
                    Ok(n) => shared.receive(&buffer[..n], &mut read_open, &mut emits),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
                    Err(e) => {
                        emits.push(Emit::Error(e));
                        false
                    },
                },
                Err(e) => {
                    emits.push(Emit::Error(e));
                    false
                },
            },
            ready = shared.stream.writable(), if wants_flush || wants_drain => match ready {
                Ok(()) => shared.on_writable(&mut emits),
                Err(e) => {
                    emits.push(Emit::Error(e));
                    false
                },
            },
            () = idle => {
                lock(&shared.state).last_activity = Instant::now();
                emits.push(Emit::Timeout);
                true
            },
        };

        shared.emit(emits);
        if !alive {
            break;
        }
    }

    let _ = SockRef::from(&shared.stream).shutdown(Shutdown::Both);
    trace!("TCP connection closed");
    if let Some(events) = shared.events() {
        events.on_close();
    }
}
