//! Duplex stream socket over a transport connection.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

use super::error::{SocketError, SocketResult};
use super::queue::{ConnectionQueue, ReadChunk};
use crate::modules::transport::{
    lock, AddressFamily, ConnectOptions, Connection, Reactor, TlsOptions, Transport,
    TransportEvents,
};

/// Global socket ID counter.
static SOCKET_ID: AtomicU64 = AtomicU64::new(0);

/// Completion callback of a write.
pub type WriteCallback = Box<dyn FnOnce(SocketResult<()>) + Send>;

/// Receives inbound chunks. Returns `false` to pause delivery.
pub type Consumer = Box<dyn FnMut(ReadChunk) -> bool + Send>;

/// Notifications published to [`StreamSocket::subscribe`] receivers.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// A dialed socket is connected.
    Connect,
    /// The peer ended its side of the stream.
    End,
    /// The socket is closed. Always the last event.
    Close,
    /// The socket failed. Reported once.
    Error(SocketError),
    /// The idle timeout elapsed. Advisory only.
    Timeout,
    /// The TLS handshake completed. Reported once.
    Secure,
}

/// Lifecycle of a socket as seen by its user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Dialing out.
    Opening,
    /// Both directions open.
    Open,
    /// The local side ended; reads continue.
    ReadOnly,
    /// The peer ended; writes continue.
    WriteOnly,
    /// Fully closed.
    Closed,
}

/// An address, port and family triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// IP address.
    pub address: IpAddr,
    /// Port.
    pub port: u16,
    /// Address family.
    pub family: AddressFamily,
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            address: addr.ip(),
            port: addr.port(),
            family: AddressFamily::of(&addr),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::new(self.address, self.port))
    }
}

struct PendingWrite {
    data: Bytes,
    callback: WriteCallback,
}

#[derive(Debug, Clone, Copy)]
struct TlsState {
    reject_unauthorized: bool,
    secure_emitted: bool,
}

struct SocketState {
    connection: Option<Box<dyn Connection>>,
    connecting: bool,
    closed: bool,
    read_ended: bool,
    write_ended: bool,
    end_pending: bool,
    queue: ConnectionQueue,
    pending: Option<PendingWrite>,
    bytes_read: u64,
    bytes_written: u64,
    timeout: Duration,
    referenced: bool,
    paused: bool,
    consumer: Option<Consumer>,
    consumer_epoch: u64,
    subscribers: Vec<UnboundedSender<SocketEvent>>,
    close_hooks: Vec<Box<dyn FnOnce() + Send>>,
    tls: Option<TlsState>,
    authorized: bool,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

impl SocketState {
    fn publish(&mut self, event: SocketEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn attach(&mut self, mut connection: Box<dyn Connection>) {
        if !self.timeout.is_zero() {
            connection.set_timeout(self.timeout);
        }
        connection.set_referenced(self.referenced);
        self.local = connection.local_addr();
        self.remote = connection.remote_addr();
        self.connection = Some(connection);
        self.connecting = false;
    }

    /// Retry the pending write. Returns its callback once fully written.
    fn flush_pending(&mut self) -> Option<WriteCallback> {
        let connection = self.connection.as_mut()?;
        let pending = self.pending.take()?;

        let written = connection.write(&pending.data);
        self.bytes_written += written as u64;
        if written < pending.data.len() {
            self.pending = Some(PendingWrite {
                data: pending.data.slice(written..),
                callback: pending.callback,
            });
            return None;
        }

        if self.end_pending {
            self.end_pending = false;
            connection.end();
        }
        Some(pending.callback)
    }
}

struct Inner {
    id: u64,
    reactor: Reactor,
    state: Mutex<SocketState>,
}

/// A duplex byte stream over one transport connection.
///
/// `StreamSocket` is a cheap handle; clones share the same socket. It is
/// also the [`TransportEvents`] sink of its connection.
///
/// At most one write is outstanding at a time: when the transport accepts
/// only part of a chunk the remainder is retried on drain and the write's
/// callback fires once everything is accepted.
#[derive(Clone)]
pub struct StreamSocket {
    inner: Arc<Inner>,
}

impl fmt::Debug for StreamSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("StreamSocket")
            .field("id", &self.inner.id)
            .field("local", &state.local)
            .field("remote", &state.remote)
            .field("closed", &state.closed)
            .finish()
    }
}

impl StreamSocket {
    fn with_state(reactor: Reactor, connecting: bool) -> Self {
        let id = SOCKET_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(Inner {
                id,
                reactor,
                state: Mutex::new(SocketState {
                    connection: None,
                    connecting,
                    closed: false,
                    read_ended: false,
                    write_ended: false,
                    end_pending: false,
                    queue: ConnectionQueue::new(),
                    pending: None,
                    bytes_read: 0,
                    bytes_written: 0,
                    timeout: Duration::ZERO,
                    referenced: true,
                    paused: false,
                    consumer: None,
                    consumer_epoch: 0,
                    subscribers: Vec::new(),
                    close_hooks: Vec::new(),
                    tls: None,
                    authorized: false,
                    local: None,
                    remote: None,
                }),
            }),
        }
    }

    /// A socket with no connection yet. Use [`attach`](Self::attach) to give
    /// it one.
    #[must_use]
    pub fn new(reactor: Reactor) -> Self {
        Self::with_state(reactor, false)
    }

    /// Dial out through `transport`.
    ///
    /// Writes issued before the connection opens are held and flushed once
    /// it does.
    #[must_use]
    pub fn connect(transport: &dyn Transport, options: &ConnectOptions, reactor: Reactor) -> Self {
        let socket = Self::with_state(reactor, true);
        debug!(socket_id = socket.id(), host = %options.host, port = options.port, "Connecting");
        transport.connect(options, socket.events_sink());
        socket
    }

    /// Wrap an accepted connection.
    #[must_use]
    pub fn from_connection(reactor: Reactor, connection: Box<dyn Connection>) -> Self {
        let socket = Self::new(reactor);
        socket.attach(connection);
        socket
    }

    /// Give the socket its connection.
    pub fn attach(&self, connection: Box<dyn Connection>) {
        let mut state = self.state();
        if state.closed {
            drop(state);
            let mut connection = connection;
            connection.destroy();
            return;
        }
        state.attach(connection);
        trace!(socket_id = self.inner.id, remote = ?state.remote, "Connection attached");
    }

    /// This socket as the event sink for its transport connection.
    #[must_use]
    pub fn events_sink(&self) -> Arc<dyn TransportEvents> {
        Arc::new(self.clone())
    }

    fn state(&self) -> MutexGuard<'_, SocketState> {
        lock(&self.inner.state)
    }

    /// Socket ID for tracking.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The reactor this socket schedules on.
    #[must_use]
    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    /// Write `chunk`. `callback` receives the outcome exactly once.
    ///
    /// The callback runs before `write` returns when the outcome is already
    /// known: a full write, an overlapping write or a closed socket.
    pub fn write<F>(&self, chunk: impl Into<Bytes>, callback: F)
    where
        F: FnOnce(SocketResult<()>) + Send + 'static,
    {
        let data = chunk.into();
        let mut state = self.state();

        if state.pending.is_some() {
            drop(state);
            warn!(socket_id = self.inner.id, "Overlapping write rejected");
            callback(Err(SocketError::OverlappingWrite));
            return;
        }
        if state.closed || state.write_ended {
            drop(state);
            callback(Err(SocketError::Closed));
            return;
        }
        if state.connecting {
            state.pending = Some(PendingWrite {
                data,
                callback: Box::new(callback),
            });
            return;
        }
        let written = state.connection.as_mut().map(|connection| connection.write(&data));
        let Some(written) = written else {
            drop(state);
            callback(Err(SocketError::NotConnected));
            return;
        };
        state.bytes_written += written as u64;
        trace!(socket_id = self.inner.id, offered = data.len(), written, "Write");

        if written < data.len() {
            state.pending = Some(PendingWrite {
                data: data.slice(written..),
                callback: Box::new(callback),
            });
            return;
        }
        drop(state);
        callback(Ok(()));
    }

    /// Whether a write is waiting for the transport to drain.
    #[must_use]
    pub fn has_pending_write(&self) -> bool {
        self.state().pending.is_some()
    }

    /// End the write side once any pending write is flushed.
    pub fn end(&self) {
        let mut state = self.state();
        if state.closed || state.write_ended {
            return;
        }
        state.write_ended = true;

        if state.pending.is_some() || state.connecting {
            state.end_pending = true;
            return;
        }
        if let Some(connection) = state.connection.as_mut() {
            connection.end();
        }
        debug!(socket_id = self.inner.id, "Socket ended");
    }

    /// Tear the socket down now.
    ///
    /// A pending write callback receives `error`, or
    /// [`SocketError::Destroyed`] without one. `error` is also published as
    /// the socket's error event.
    pub fn destroy(&self, error: Option<SocketError>) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        state.closed = true;
        state.read_ended = true;
        state.write_ended = true;
        state.connecting = false;

        if let Some(mut connection) = state.connection.take() {
            connection.destroy();
        }
        let pending = state.pending.take();
        let hooks = std::mem::take(&mut state.close_hooks);
        drop(state);

        match &error {
            Some(e) => debug!(socket_id = self.inner.id, error = %e, "Socket destroyed"),
            None => debug!(socket_id = self.inner.id, "Socket destroyed"),
        }

        if let Some(pending) = pending {
            (pending.callback)(Err(error.clone().unwrap_or(SocketError::Destroyed)));
        }

        let mut state = self.state();
        if let Some(error) = error {
            state.publish(SocketEvent::Error(error));
        }
        state.publish(SocketEvent::Close);
        state.subscribers.clear();
        drop(state);

        for hook in hooks {
            hook();
        }
    }

    /// End the socket and run `callback` once it is closed.
    pub fn close<F>(&self, callback: F)
    where
        F: FnOnce(SocketResult<()>) + Send + 'static,
    {
        if self.state().closed {
            self.inner.reactor.defer(move || callback(Ok(())));
            return;
        }
        self.on_closed(move || callback(Ok(())));
        self.end();
    }

    /// Run `hook` once the socket closes. Runs on the next reactor turn if
    /// the socket is already closed.
    pub fn on_closed<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state();
        if state.closed {
            drop(state);
            self.inner.reactor.defer(hook);
            return;
        }
        state.close_hooks.push(Box::new(hook));
    }

    /// Set the idle timeout. `Duration::ZERO` disables it.
    pub fn set_timeout(&self, timeout: Duration) {
        let mut state = self.state();
        state.timeout = timeout;
        if let Some(connection) = state.connection.as_mut() {
            connection.set_timeout(timeout);
        }
    }

    /// Keep the reactor alive while this socket is open.
    pub fn reference(&self) {
        self.set_referenced(true);
    }

    /// Stop keeping the reactor alive on behalf of this socket.
    pub fn unreference(&self) {
        self.set_referenced(false);
    }

    fn set_referenced(&self, referenced: bool) {
        let mut state = self.state();
        state.referenced = referenced;
        if let Some(connection) = state.connection.as_mut() {
            connection.set_referenced(referenced);
        }
    }

    /// Promote the connection to TLS.
    ///
    /// On success the raw handle is unreferenced and destroyed and all
    /// further I/O goes through the TLS handle; [`SocketEvent::Secure`]
    /// follows once the handshake completes.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotConnected`] without a connection and
    /// [`SocketError::TlsUpgradeFailed`] when the transport refuses. A
    /// refusal destroys the socket with that error, so close hooks run.
    pub fn upgrade_to_tls(&self, options: &TlsOptions) -> SocketResult<()> {
        let sink = self.events_sink();
        let mut state = self.state();
        let Some(mut connection) = state.connection.take() else {
            return Err(SocketError::NotConnected);
        };

        match connection.upgrade_tls(options, sink) {
            Some((mut raw, mut tls)) => {
                raw.set_referenced(false);
                raw.destroy();
                drop(raw);
                drop(connection);

                if !state.timeout.is_zero() {
                    tls.set_timeout(state.timeout);
                }
                tls.set_referenced(state.referenced);
                state.connection = Some(tls);
                state.tls = Some(TlsState {
                    reject_unauthorized: options.reject_unauthorized,
                    secure_emitted: false,
                });
                state.authorized = false;
                debug!(socket_id = self.inner.id, "Socket upgraded to TLS");
                Ok(())
            },
            None => {
                state.connection = Some(connection);
                drop(state);
                warn!(socket_id = self.inner.id, "TLS upgrade refused by transport");
                self.destroy(Some(SocketError::TlsUpgradeFailed));
                Err(SocketError::TlsUpgradeFailed)
            },
        }
    }

    /// Deliver inbound chunks to `consumer` instead of queueing them.
    /// Anything already queued is delivered first.
    pub fn set_consumer<F>(&self, consumer: F)
    where
        F: FnMut(ReadChunk) -> bool + Send + 'static,
    {
        let mut state = self.state();
        state.consumer = Some(Box::new(consumer));
        state.consumer_epoch += 1;
        drop(state);
        self.drain_queue();
    }

    /// Remove the consumer. Later chunks queue up until a new one is set.
    pub fn clear_consumer(&self) {
        let mut state = self.state();
        state.consumer = None;
        state.consumer_epoch += 1;
    }

    /// Stop delivering chunks to the consumer; they queue up instead.
    pub fn pause(&self) {
        self.state().paused = true;
    }

    /// Resume delivery, starting with queued chunks.
    pub fn resume(&self) {
        self.state().paused = false;
        self.drain_queue();
    }

    /// Whether delivery is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    /// Take the oldest queued chunk.
    #[must_use]
    pub fn read(&self) -> Option<ReadChunk> {
        self.state().queue.shift()
    }

    /// Number of queued chunks.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.state().queue.len()
    }

    /// Receive this socket's events from now on.
    #[must_use]
    pub fn subscribe(&self) -> UnboundedReceiver<SocketEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        if state.closed {
            let _ = tx.send(SocketEvent::Close);
        } else {
            state.subscribers.push(tx);
        }
        rx
    }

    /// Total bytes delivered by the transport.
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.state().bytes_read
    }

    /// Total bytes the transport accepted.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.state().bytes_written
    }

    /// Local address of the connection.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state().local
    }

    /// Remote address of the connection.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.state().remote
    }

    /// Local address, port and family.
    #[must_use]
    pub fn address(&self) -> Option<Endpoint> {
        self.local_addr().map(Endpoint::from)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        let state = self.state();
        if state.connecting {
            return ReadyState::Opening;
        }
        if state.closed {
            return ReadyState::Closed;
        }
        match (state.read_ended, state.write_ended) {
            (false, false) => ReadyState::Open,
            (false, true) => ReadyState::ReadOnly,
            (true, false) => ReadyState::WriteOnly,
            (true, true) => ReadyState::Closed,
        }
    }

    /// Whether the socket has no connection or is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Whether the socket was upgraded to TLS.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.state().tls.is_some()
    }

    /// Whether the TLS peer passed verification.
    #[must_use]
    pub fn authorized(&self) -> bool {
        self.state().authorized
    }

    /// Hand `chunk` to the consumer if nothing is queued ahead of it,
    /// otherwise queue it.
    fn deliver(&self, mut state: MutexGuard<'_, SocketState>, chunk: ReadChunk) {
        if state.paused || !state.queue.is_empty() {
            state.queue.push(chunk);
            return;
        }
        let Some(mut consumer) = state.consumer.take() else {
            state.queue.push(chunk);
            return;
        };
        let epoch = state.consumer_epoch;
        drop(state);

        let more = consumer(chunk);

        let mut state = self.state();
        if state.consumer_epoch == epoch {
            state.consumer = Some(consumer);
        }
        if !more {
            state.paused = true;
        }
    }

    fn drain_queue(&self) {
        loop {
            let mut state = self.state();
            if state.paused {
                return;
            }
            let Some(mut consumer) = state.consumer.take() else {
                return;
            };
            let Some(chunk) = state.queue.shift() else {
                state.consumer = Some(consumer);
                return;
            };
            let epoch = state.consumer_epoch;
            drop(state);

            let more = consumer(chunk);

            let mut state = self.state();
            if state.consumer_epoch == epoch {
                state.consumer = Some(consumer);
            }
            if !more {
                state.paused = true;
            }
        }
    }

    fn finish_read(&self) -> bool {
        let mut state = self.state();
        if state.read_ended {
            return false;
        }
        state.read_ended = true;
        self.deliver(state, ReadChunk::End);
        true
    }
}

impl TransportEvents for StreamSocket {
    fn on_open(&self, connection: Box<dyn Connection>) {
        let mut state = self.state();
        if state.closed {
            drop(state);
            let mut connection = connection;
            connection.destroy();
            return;
        }
        state.attach(connection);
        debug!(socket_id = self.inner.id, remote = ?state.remote, "Socket connected");
        state.publish(SocketEvent::Connect);

        let completed = state.flush_pending();
        if state.end_pending && state.pending.is_none() {
            state.end_pending = false;
            if let Some(connection) = state.connection.as_mut() {
                connection.end();
            }
        }
        drop(state);

        if let Some(callback) = completed {
            callback(Ok(()));
        }
    }

    fn on_connect_error(&self, error: io::Error) {
        debug!(socket_id = self.inner.id, error = %error, "Connect failed");
        self.destroy(Some(SocketError::Connect(Arc::new(error))));
    }

    fn on_data(&self, chunk: Bytes) {
        let mut state = self.state();
        if state.closed || state.read_ended {
            return;
        }
        state.bytes_read += chunk.len() as u64;
        trace!(socket_id = self.inner.id, len = chunk.len(), "Data");
        self.deliver(state, ReadChunk::Data(chunk));
    }

    fn on_drain(&self) {
        let completed = self.state().flush_pending();
        if let Some(callback) = completed {
            trace!(socket_id = self.inner.id, "Pending write drained");
            callback(Ok(()));
        }
    }

    fn on_end(&self) {
        let closed = self.state().closed;
        if closed || !self.finish_read() {
            return;
        }
        self.state().publish(SocketEvent::End);
        // Half-open sockets are not kept: end our side too.
        self.end();
    }

    fn on_close(&self) {
        if self.state().closed {
            return;
        }
        self.finish_read();

        let mut state = self.state();
        if state.closed {
            return;
        }
        state.closed = true;
        state.write_ended = true;
        state.connection = None;
        let pending = state.pending.take();
        let hooks = std::mem::take(&mut state.close_hooks);
        drop(state);

        debug!(socket_id = self.inner.id, "Socket closed");

        if let Some(pending) = pending {
            (pending.callback)(Err(SocketError::Closed));
        }

        let mut state = self.state();
        state.publish(SocketEvent::Close);
        state.subscribers.clear();
        drop(state);

        for hook in hooks {
            hook();
        }
    }

    fn on_error(&self, error: io::Error) {
        warn!(socket_id = self.inner.id, error = %error, "Transport error");
        self.destroy(Some(SocketError::transport(error)));
    }

    fn on_timeout(&self) {
        trace!(socket_id = self.inner.id, "Idle timeout");
        self.state().publish(SocketEvent::Timeout);
    }

    fn on_handshake(&self, success: bool, verify_error: Option<String>) {
        let mut state = self.state();
        let Some(mut tls) = state.tls else {
            return;
        };
        if state.closed {
            return;
        }

        if let Some(reason) = verify_error {
            state.authorized = false;
            if tls.reject_unauthorized {
                drop(state);
                warn!(socket_id = self.inner.id, error = %reason, "TLS peer rejected");
                self.destroy(Some(SocketError::TlsHandshake(reason)));
                return;
            }
            debug!(socket_id = self.inner.id, error = %reason, "TLS peer not verified");
        } else if success {
            state.authorized = true;
        } else {
            drop(state);
            self.destroy(Some(SocketError::TlsHandshake("handshake failed".to_string())));
            return;
        }

        if !tls.secure_emitted {
            tls.secure_emitted = true;
            state.tls = Some(tls);
            state.publish(SocketEvent::Secure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::transport::{MemoryConnection, MemoryConnectionHandle};
    use std::sync::atomic::AtomicUsize;

    fn socket() -> (StreamSocket, MemoryConnectionHandle) {
        let local: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let (connection, handle) = MemoryConnection::pair(local, remote);
        let socket = StreamSocket::from_connection(Reactor::current().unwrap(), Box::new(connection));
        handle.set_events(socket.events_sink());
        (socket, handle)
    }

    fn recorder() -> (Arc<Mutex<Vec<SocketResult<()>>>>, impl Fn() -> WriteCallback) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        let make = move || -> WriteCallback {
            let sink = Arc::clone(&sink);
            Box::new(move |result| lock(&sink).push(result))
        };
        (results, make)
    }

    #[tokio::test]
    async fn test_full_write_completes_immediately() {
        let (socket, handle) = socket();
        let (results, callback) = recorder();

        socket.write(Bytes::from_static(b"hello"), callback());

        assert_eq!(lock(&results).len(), 1);
        assert!(lock(&results)[0].is_ok());
        assert_eq!(socket.bytes_written(), 5);
        assert_eq!(handle.written(), b"hello");
    }

    #[tokio::test]
    async fn test_partial_write_completes_after_drain() {
        let (socket, handle) = socket();
        handle.set_write_budget(Some(3));
        let (results, callback) = recorder();

        socket.write(Bytes::from_static(b"abcdefgh"), callback());
        assert!(lock(&results).is_empty());
        assert!(socket.has_pending_write());
        assert_eq!(socket.bytes_written(), 3);

        handle.grant(2);
        assert!(lock(&results).is_empty());
        assert_eq!(socket.bytes_written(), 5);

        handle.grant(10);
        assert_eq!(lock(&results).len(), 1);
        assert!(lock(&results)[0].is_ok());
        assert_eq!(socket.bytes_written(), 8);
        assert_eq!(handle.written(), b"abcdefgh");
    }

    #[tokio::test]
    async fn test_overlapping_write_leaves_pending_intact() {
        let (socket, handle) = socket();
        handle.set_write_budget(Some(1));
        let (results, callback) = recorder();

        socket.write(Bytes::from_static(b"first"), callback());
        let (second, second_callback) = recorder();
        socket.write(Bytes::from_static(b"second"), second_callback());

        assert!(matches!(
            lock(&second)[0],
            Err(SocketError::OverlappingWrite)
        ));
        assert!(lock(&results).is_empty());

        handle.grant(100);
        assert!(lock(&results)[0].is_ok());
        assert_eq!(handle.written(), b"first");
    }

    #[tokio::test]
    async fn test_destroy_fails_pending_write_once() {
        let (socket, handle) = socket();
        handle.set_write_budget(Some(0));
        let (results, callback) = recorder();
        let mut events = socket.subscribe();

        socket.write(Bytes::from_static(b"stuck"), callback());
        socket.destroy(Some(SocketError::TlsHandshake("boom".to_string())));
        socket.destroy(None);
        handle.push_close();

        assert_eq!(lock(&results).len(), 1);
        assert!(matches!(lock(&results)[0], Err(SocketError::TlsHandshake(_))));
        assert!(handle.is_destroyed());
        assert!(matches!(events.recv().await, Some(SocketEvent::Error(_))));
        assert!(matches!(events.recv().await, Some(SocketEvent::Close)));
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_destroy_without_error_reports_destroyed() {
        let (socket, handle) = socket();
        handle.set_write_budget(Some(0));
        let (results, callback) = recorder();

        socket.write(Bytes::from_static(b"stuck"), callback());
        socket.destroy(None);

        assert!(matches!(lock(&results)[0], Err(SocketError::Destroyed)));
    }

    #[tokio::test]
    async fn test_transport_error_reaches_pending_callback_first() {
        let (socket, handle) = socket();
        handle.set_write_budget(Some(0));
        let (results, callback) = recorder();
        let mut events = socket.subscribe();

        socket.write(Bytes::from_static(b"stuck"), callback());
        handle.push_error(io::Error::from(io::ErrorKind::ConnectionReset));

        assert!(matches!(lock(&results)[0], Err(SocketError::Transport(_))));
        assert!(matches!(events.recv().await, Some(SocketEvent::Error(_))));
        assert!(matches!(events.recv().await, Some(SocketEvent::Close)));
    }

    #[tokio::test]
    async fn test_data_queues_without_consumer() {
        let (socket, handle) = socket();
        handle.push_data(Bytes::from_static(b"one"));
        handle.push_data(Bytes::from_static(b"two"));

        assert_eq!(socket.bytes_read(), 6);
        assert_eq!(socket.queued(), 2);
        assert_eq!(socket.read(), Some(ReadChunk::Data(Bytes::from_static(b"one"))));
        assert_eq!(socket.read(), Some(ReadChunk::Data(Bytes::from_static(b"two"))));
        assert_eq!(socket.read(), None);
    }

    #[tokio::test]
    async fn test_consumer_receives_queued_then_live_data() {
        let (socket, handle) = socket();
        handle.push_data(Bytes::from_static(b"early"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        socket.set_consumer(move |chunk| {
            lock(&sink).push(chunk);
            true
        });
        handle.push_data(Bytes::from_static(b"late"));
        handle.push_end();

        let seen = lock(&seen);
        assert_eq!(
            *seen,
            vec![
                ReadChunk::Data(Bytes::from_static(b"early")),
                ReadChunk::Data(Bytes::from_static(b"late")),
                ReadChunk::End,
            ]
        );
    }

    #[tokio::test]
    async fn test_consumer_backpressure_pauses() {
        let (socket, handle) = socket();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        socket.set_consumer(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        });

        handle.push_data(Bytes::from_static(b"a"));
        handle.push_data(Bytes::from_static(b"b"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(socket.is_paused());
        assert_eq!(socket.queued(), 1);

        socket.resume();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(socket.queued(), 0);
    }

    #[tokio::test]
    async fn test_no_reads_after_end() {
        let (socket, handle) = socket();
        handle.push_end();
        handle.push_data(Bytes::from_static(b"ignored"));

        assert_eq!(socket.read(), Some(ReadChunk::End));
        assert_eq!(socket.read(), None);
        assert_eq!(socket.bytes_read(), 0);
        // Peer end also ends our side.
        assert!(handle.is_ended());
    }

    #[tokio::test]
    async fn test_close_enqueues_end_and_runs_hooks() {
        let (socket, handle) = socket();
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        socket.on_closed(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.push_close();
        handle.push_close();

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(socket.read(), Some(ReadChunk::End));
        assert_eq!(socket.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_end_waits_for_pending_write() {
        let (socket, handle) = socket();
        handle.set_write_budget(Some(2));
        let (results, callback) = recorder();

        socket.write(Bytes::from_static(b"abcd"), callback());
        socket.end();
        assert!(!handle.is_ended());
        assert_eq!(socket.ready_state(), ReadyState::ReadOnly);

        handle.grant(2);
        assert!(lock(&results)[0].is_ok());
        assert!(handle.is_ended());
    }

    #[tokio::test]
    async fn test_write_after_end_fails() {
        let (socket, _handle) = socket();
        let (results, callback) = recorder();
        socket.end();
        socket.write(Bytes::from_static(b"late"), callback());
        assert!(matches!(lock(&results)[0], Err(SocketError::Closed)));
    }

    #[tokio::test]
    async fn test_forwarders() {
        let (socket, handle) = socket();
        socket.set_timeout(Duration::from_millis(250));
        socket.unreference();
        assert_eq!(handle.timeout(), Duration::from_millis(250));
        assert!(!handle.is_referenced());

        socket.reference();
        assert!(handle.is_referenced());

        let endpoint = socket.address().unwrap();
        assert_eq!(endpoint.port, 8080);
        assert_eq!(endpoint.family, AddressFamily::IPv4);
    }

    #[tokio::test]
    async fn test_timeout_is_advisory() {
        let (socket, handle) = socket();
        let mut events = socket.subscribe();
        handle.push_timeout();

        assert!(matches!(events.recv().await, Some(SocketEvent::Timeout)));
        assert!(!socket.is_closed());
    }

    #[tokio::test]
    async fn test_close_callback_runs_after_close() {
        let (socket, handle) = socket();
        let (tx, rx) = tokio::sync::oneshot::channel();
        socket.close(move |result| {
            let _ = tx.send(result.is_ok());
        });
        assert!(handle.is_ended());

        handle.push_close();
        assert!(rx.await.unwrap());
    }
}
