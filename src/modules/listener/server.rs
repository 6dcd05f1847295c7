//! Connection-accepting server with a concurrency limit and graceful close.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use super::config::ListenerServerConfig;
use super::error::{ListenerError, ListenerResult};
use crate::modules::stream_socket::{Endpoint, StreamSocket};
use crate::modules::transport::{
    lock, Acceptor, Connection, ListenOptions, Listener, Reactor, Transport, TransportEvents,
};

/// Where a [`ListenerServer`] gets its connections from.
pub enum ListenerMode {
    /// Bind a listener with these options and own it.
    Owned(ListenOptions),
    /// Take over a caller-bound listener.
    Attached(Box<dyn Listener>),
    /// No listener: connections are fed through [`ListenerServer::accept`].
    NoListener,
}

impl fmt::Debug for ListenerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owned(options) => f.debug_tuple("Owned").field(options).finish(),
            Self::Attached(listener) => f.debug_tuple("Attached").field(listener).finish(),
            Self::NoListener => f.write_str("NoListener"),
        }
    }
}

/// Lifecycle of a listener server. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Accepting connections.
    Running,
    /// Close requested; waiting for the listener or live connections.
    Closing,
    /// Closed.
    Closed,
}

/// Addresses of a connection refused for capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropSnapshot {
    /// Local side.
    pub local: Option<Endpoint>,
    /// Remote side.
    pub remote: Option<Endpoint>,
}

/// Notifications from a [`ListenerServer`].
#[derive(Debug)]
pub enum ListenerEvent {
    /// The listener is bound.
    Listening(SocketAddr),
    /// A connection was accepted.
    Connection(StreamSocket),
    /// A connection was refused because the server is full.
    Drop(DropSnapshot),
    /// The server closed. Emitted once per close request.
    Close,
    /// The listener failed.
    Error(Arc<io::Error>),
}

/// Identifies a connection hook for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

type ConnectionHook = Arc<dyn Fn(&StreamSocket) + Send + Sync>;
type CloseCallback = Box<dyn FnOnce(ListenerResult<()>) + Send>;

struct ServerState {
    lifecycle: ListenerState,
    owned: bool,
    listener: Option<Box<dyn Listener>>,
    connections: usize,
    deferred_close: bool,
    hooks: Vec<(HookId, ConnectionHook)>,
    next_hook: u64,
    close_callbacks: Vec<CloseCallback>,
}

struct ServerInner {
    reactor: Reactor,
    config: ListenerServerConfig,
    events: UnboundedSender<ListenerEvent>,
    state: Mutex<ServerState>,
}

/// Accepts connections, enforces `max_connections` and closes gracefully.
///
/// On close every mode stops taking connections and waits for the last live
/// one. Owned mode stops its listener first and reports the close once the
/// listener is gone and no connections remain. Attached and no-listener
/// modes detach; with no live connections the close is reported on the
/// next reactor turn.
#[derive(Clone)]
pub struct ListenerServer {
    inner: Arc<ServerInner>,
}

impl fmt::Debug for ListenerServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("ListenerServer")
            .field("state", &state.lifecycle)
            .field("connections", &state.connections)
            .field("max_connections", &self.inner.config.max_connections)
            .finish()
    }
}

/// Hands accepted connections to the server without keeping it alive.
struct ServerAcceptor(Weak<ServerInner>);

impl Acceptor for ServerAcceptor {
    fn on_open(&self, connection: Box<dyn Connection>) -> Option<Arc<dyn TransportEvents>> {
        let Some(inner) = self.0.upgrade() else {
            let mut connection = connection;
            connection.end();
            return None;
        };
        ListenerServer { inner }
            .accept(connection)
            .map(|socket| socket.events_sink())
    }

    fn on_error(&self, error: io::Error) {
        if let Some(inner) = self.0.upgrade() {
            warn!(error = %error, "Listener error");
            let _ = inner.events.send(ListenerEvent::Error(Arc::new(error)));
        }
    }
}

impl ListenerServer {
    /// Start a server.
    ///
    /// Returns the server and the receiver of its events. `Listening` is
    /// delivered on the next reactor turn for modes with a listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the owned listener cannot be bound.
    pub fn new(
        transport: &dyn Transport,
        mode: ListenerMode,
        config: ListenerServerConfig,
        reactor: Reactor,
    ) -> ListenerResult<(Self, UnboundedReceiver<ListenerEvent>)> {
        let (events, rx) = mpsc::unbounded_channel();
        let server = Self {
            inner: Arc::new(ServerInner {
                reactor,
                config,
                events,
                state: Mutex::new(ServerState {
                    lifecycle: ListenerState::Running,
                    owned: matches!(mode, ListenerMode::Owned(_)),
                    listener: None,
                    connections: 0,
                    deferred_close: false,
                    hooks: Vec::new(),
                    next_hook: 0,
                    close_callbacks: Vec::new(),
                }),
            }),
        };

        let acceptor: Arc<dyn Acceptor> = Arc::new(ServerAcceptor(Arc::downgrade(&server.inner)));
        let listener = match mode {
            ListenerMode::Owned(options) => Some(transport.listen(&options, acceptor)?),
            ListenerMode::Attached(mut listener) => {
                listener.set_acceptor(Some(acceptor));
                Some(listener)
            },
            ListenerMode::NoListener => None,
        };

        if let Some(address) = listener.as_ref().and_then(|l| l.local_addr()) {
            info!(address = %address, "Listener server started");
            let events = server.inner.events.clone();
            server.inner.reactor.defer(move || {
                let _ = events.send(ListenerEvent::Listening(address));
            });
        }
        server.state().listener = listener;

        Ok((server, rx))
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        lock(&self.inner.state)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> ListenerState {
        self.state().lifecycle
    }

    /// Number of live accepted connections.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.state().connections
    }

    /// The listener's bound address, if there is a listener.
    #[must_use]
    pub fn address(&self) -> Option<SocketAddr> {
        self.state().listener.as_ref().and_then(|l| l.local_addr())
    }

    /// The server configuration.
    #[must_use]
    pub fn config(&self) -> &ListenerServerConfig {
        &self.inner.config
    }

    /// The reactor the server schedules on.
    #[must_use]
    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    /// Run `hook` for every accepted socket.
    pub fn on_connection<F>(&self, hook: F) -> HookId
    where
        F: Fn(&StreamSocket) + Send + Sync + 'static,
    {
        let mut state = self.state();
        let id = HookId(state.next_hook);
        state.next_hook += 1;
        state.hooks.push((id, Arc::new(hook)));
        id
    }

    /// Remove a connection hook. Returns whether it was registered.
    pub fn remove_hook(&self, id: HookId) -> bool {
        let mut state = self.state();
        let before = state.hooks.len();
        state.hooks.retain(|(hook_id, _)| *hook_id != id);
        state.hooks.len() != before
    }

    /// Take a connection.
    ///
    /// Over capacity the connection is ended, a [`ListenerEvent::Drop`] is
    /// queued for the next reactor turn and `None` is returned; no hook runs
    /// and the live count is unchanged. Otherwise the connection is wrapped
    /// in a [`StreamSocket`] that counts as live until it closes.
    pub fn accept(&self, connection: Box<dyn Connection>) -> Option<StreamSocket> {
        let mut connection = connection;
        let mut state = self.state();

        if state.lifecycle != ListenerState::Running {
            drop(state);
            debug!("Server not running, ending connection");
            connection.end();
            return None;
        }

        if !self.inner.config.has_capacity(state.connections) {
            let snapshot = DropSnapshot {
                local: connection.local_addr().map(Endpoint::from),
                remote: connection.remote_addr().map(Endpoint::from),
            };
            let connections = state.connections;
            drop(state);

            connection.end();
            warn!(
                remote = ?snapshot.remote,
                connections,
                max_connections = self.inner.config.max_connections,
                "Connection dropped: server full"
            );

            let events = self.inner.events.clone();
            self.inner.reactor.defer(move || {
                let _ = events.send(ListenerEvent::Drop(snapshot));
            });
            return None;
        }

        state.connections += 1;
        let hooks: Vec<ConnectionHook> = state.hooks.iter().map(|(_, hook)| Arc::clone(hook)).collect();
        drop(state);

        let socket = StreamSocket::from_connection(self.inner.reactor.clone(), connection);
        if self.inner.config.pause_on_connect {
            socket.pause();
        }

        let weak = Arc::downgrade(&self.inner);
        socket.on_closed(move || {
            if let Some(inner) = weak.upgrade() {
                ListenerServer { inner }.release();
            }
        });

        debug!(socket_id = socket.id(), remote = ?socket.remote_addr(), "Connection accepted");

        for hook in hooks {
            hook(&socket);
        }
        let _ = self
            .inner
            .events
            .send(ListenerEvent::Connection(socket.clone()));

        Some(socket)
    }

    fn release(&self) {
        let mut state = self.state();
        state.connections = state.connections.saturating_sub(1);
        if state.deferred_close && state.connections == 0 {
            state.deferred_close = false;
            drop(state);
            self.schedule_finish();
        }
    }

    /// The owned listener is gone; close now or once the last live
    /// connection is released.
    fn listener_stopped(&self) {
        let mut state = self.state();
        if state.connections == 0 {
            drop(state);
            self.finish_close();
        } else {
            debug!(connections = state.connections, "Waiting for connections to close");
            state.deferred_close = true;
        }
    }

    fn schedule_finish(&self) {
        let server = self.clone();
        self.inner.reactor.defer(move || server.finish_close());
    }

    fn finish_close(&self) {
        let callbacks = {
            let mut state = self.state();
            state.lifecycle = ListenerState::Closed;
            std::mem::take(&mut state.close_callbacks)
        };

        info!("Listener server closed");
        for callback in callbacks {
            callback(Ok(()));
        }
        let _ = self.inner.events.send(ListenerEvent::Close);
    }

    /// Stop accepting and close once drained.
    ///
    /// `callback` receives `Ok` when the server closes, or
    /// [`ListenerError::NotRunning`] on the next reactor turn if it is
    /// already closed. Either way a [`ListenerEvent::Close`] follows.
    pub fn close<F>(&self, callback: F)
    where
        F: FnOnce(ListenerResult<()>) + Send + 'static,
    {
        let mut state = self.state();
        match state.lifecycle {
            ListenerState::Closed => {
                drop(state);
                let events = self.inner.events.clone();
                self.inner.reactor.defer(move || {
                    callback(Err(ListenerError::NotRunning));
                    let _ = events.send(ListenerEvent::Close);
                });
                return;
            },
            ListenerState::Closing => {
                state.close_callbacks.push(Box::new(callback));
                return;
            },
            ListenerState::Running => {},
        }

        state.lifecycle = ListenerState::Closing;
        state.close_callbacks.push(Box::new(callback));
        info!(connections = state.connections, "Listener server closing");

        if state.owned {
            let listener = state.listener.take();
            drop(state);
            match listener {
                Some(mut listener) => {
                    let server = self.clone();
                    listener.stop(Box::new(move || server.listener_stopped()));
                },
                None => self.schedule_finish(),
            }
            return;
        }

        if let Some(listener) = state.listener.as_mut() {
            listener.set_acceptor(None);
        }
        if state.connections == 0 {
            drop(state);
            self.schedule_finish();
        } else {
            state.deferred_close = true;
        }
    }
}
