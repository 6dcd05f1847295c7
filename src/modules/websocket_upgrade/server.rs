//! The upgrade server: handshake orchestration and client tracking.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use super::client::{ClientOptions, WebSocketClient};
use super::config::UpgradeServerConfig;
use super::error::{HandshakeError, HandshakeResult, UpgradeError, UpgradeResult};
use super::exchange::{Promotion, SocketExchange, UpgradeExchange};
use super::request::UpgradeRequest;
use super::response::{abort_response, upgrade_header_lines, upgrade_required_response};
use super::validator::{
    parse_subprotocols, parse_version, validate_key, validate_method, validate_upgrade_header,
    SubprotocolSet,
};
use super::verify::{ClientInfo, Verdict, VerifyClient, VerifyResponder};
use crate::modules::listener::{
    HookId, ListenerEvent, ListenerMode, ListenerServer, ListenerServerConfig,
};
use crate::modules::stream_socket::{ReadChunk, StreamSocket};
use crate::modules::transport::{
    lock, ListenOptions, Reactor, TcpTransport, TlsOptions, Transport,
};

const RUNNING: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle of an upgrade server. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    /// Accepting handshakes.
    Running,
    /// Close requested.
    Closing,
    /// Closed.
    Closed,
}

/// Where the server gets its connections from.
#[derive(Debug, Clone)]
pub enum ServerMode {
    /// A listener server bound and owned by the upgrade server.
    Port(ListenerServer),
    /// A caller-supplied listener server.
    Server(ListenerServer),
    /// No listener; requests arrive through [`UpgradeServer::handle_upgrade`].
    NoServer,
}

/// Notifications from an [`UpgradeServer`].
#[derive(Debug)]
pub enum UpgradeEvent {
    /// The owned listener is bound.
    Listening(SocketAddr),
    /// A connection read by the built-in driver was promoted.
    Connection(WebSocketClient),
    /// The owned listener failed.
    Error(Arc<io::Error>),
    /// The server closed. Emitted once per close request.
    Close,
}

/// Picks a subprotocol from the offered set.
pub type ProtocolSelector =
    Arc<dyn Fn(&SubprotocolSet, &UpgradeRequest) -> Option<String> + Send + Sync>;

/// Decides whether the server handles a request.
pub type PathFilter = Arc<dyn Fn(&UpgradeRequest) -> bool + Send + Sync>;

/// Edits the response lines before they are written.
pub type HeadersHook = Arc<dyn Fn(&mut Vec<String>, &UpgradeRequest) + Send + Sync>;

/// Answers rejected handshakes in place of the default abort response.
pub type ClientErrorHook =
    Arc<dyn Fn(&HandshakeError, Box<dyn UpgradeExchange>, &UpgradeRequest) + Send + Sync>;

type UpgradeCallback = Box<dyn FnOnce(HandshakeResult<WebSocketClient>) + Send>;
type CloseCallback = Box<dyn FnOnce(UpgradeResult<()>) + Send>;

#[derive(Clone, Default)]
struct Hooks {
    handle_protocols: Option<ProtocolSelector>,
    verify_client: Option<VerifyClient>,
    path_filter: Option<PathFilter>,
    on_headers: Option<HeadersHook>,
    on_client_error: Option<ClientErrorHook>,
}

#[derive(Default)]
struct Tracking {
    clients: HashMap<u64, WebSocketClient>,
    close_when_empty: bool,
}

struct ServerInner {
    config: UpgradeServerConfig,
    hooks: Hooks,
    reactor: Reactor,
    mode: ServerMode,
    tls: Option<TlsOptions>,
    hook: Mutex<Option<HookId>>,
    lifecycle: AtomicU8,
    close_callbacks: Mutex<Vec<CloseCallback>>,
    tracking: Mutex<Tracking>,
    events: UnboundedSender<UpgradeEvent>,
}

/// Validates upgrade requests and promotes their connections.
///
/// Requests are checked in a fixed order and the first failure decides the
/// response: 503 when not running, then 405 method, 400 `Upgrade` header,
/// key, version, path and subprotocol grammar. The verification hook runs
/// next (401 by default), then the promotion.
#[derive(Clone)]
pub struct UpgradeServer {
    inner: Arc<ServerInner>,
}

impl fmt::Debug for UpgradeServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeServer")
            .field("state", &self.state())
            .field("mode", &self.inner.mode)
            .field("path", &self.inner.config.path)
            .finish()
    }
}

/// Builder for [`UpgradeServer`].
pub struct UpgradeServerBuilder {
    config: UpgradeServerConfig,
    server: Option<ListenerServer>,
    transport: Option<Arc<dyn Transport>>,
    reactor: Option<Reactor>,
    tls: Option<TlsOptions>,
    hooks: Hooks,
}

impl fmt::Debug for UpgradeServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeServerBuilder")
            .field("config", &self.config)
            .field("server", &self.server)
            .field("tls", &self.tls)
            .field("verify_client", &self.hooks.verify_client)
            .finish_non_exhaustive()
    }
}

impl UpgradeServerBuilder {
    /// Take connections from an existing listener server.
    #[must_use]
    pub fn server(mut self, server: ListenerServer) -> Self {
        self.server = Some(server);
        self
    }

    /// Bind the owned listener through `transport` instead of TCP.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Schedule on `reactor` instead of the current runtime.
    #[must_use]
    pub fn reactor(mut self, reactor: Reactor) -> Self {
        self.reactor = Some(reactor);
        self
    }

    /// Upgrade accepted sockets to TLS before reading the request head.
    #[must_use]
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Choose the subprotocol. Without a selector the first offered one wins.
    #[must_use]
    pub fn handle_protocols<F>(mut self, select: F) -> Self
    where
        F: Fn(&SubprotocolSet, &UpgradeRequest) -> Option<String> + Send + Sync + 'static,
    {
        self.hooks.handle_protocols = Some(Arc::new(select));
        self
    }

    /// Verify clients before promotion.
    #[must_use]
    pub fn verify_client(mut self, verify: VerifyClient) -> Self {
        self.hooks.verify_client = Some(verify);
        self
    }

    /// Replace the configured-path check.
    #[must_use]
    pub fn path_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&UpgradeRequest) -> bool + Send + Sync + 'static,
    {
        self.hooks.path_filter = Some(Arc::new(filter));
        self
    }

    /// Edit the `101` response lines.
    #[must_use]
    pub fn on_headers<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Vec<String>, &UpgradeRequest) + Send + Sync + 'static,
    {
        self.hooks.on_headers = Some(Arc::new(hook));
        self
    }

    /// Answer rejected handshakes yourself.
    #[must_use]
    pub fn on_client_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HandshakeError, Box<dyn UpgradeExchange>, &UpgradeRequest) + Send + Sync + 'static,
    {
        self.hooks.on_client_error = Some(Arc::new(hook));
        self
    }

    /// Start the server.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid configuration, outside a runtime
    /// without an explicit reactor, or if the owned listener cannot bind.
    pub fn build(self) -> UpgradeResult<(UpgradeServer, UnboundedReceiver<UpgradeEvent>)> {
        let Self {
            config,
            server,
            transport,
            reactor,
            tls,
            hooks,
        } = self;
        config.validate(server.is_some())?;
        let reactor = match reactor {
            Some(reactor) => reactor,
            None => Reactor::current()?,
        };

        let (events, rx) = mpsc::unbounded_channel();
        let mode = match (config.port, server) {
            (Some(port), _) => {
                let transport: Arc<dyn Transport> = match transport {
                    Some(transport) => transport,
                    None => Arc::new(TcpTransport::new(reactor.clone())),
                };
                let mut options =
                    ListenOptions::new(port).host(config.host.as_deref().unwrap_or("0.0.0.0"));
                options.backlog = config.backlog;
                let (listener, listener_events) = ListenerServer::new(
                    transport.as_ref(),
                    ListenerMode::Owned(options),
                    ListenerServerConfig::default().max_connections(config.max_connections),
                    reactor.clone(),
                )?;
                forward_listener_events(&reactor, listener_events, events.clone());
                ServerMode::Port(listener)
            },
            (None, Some(listener)) => ServerMode::Server(listener),
            (None, None) => ServerMode::NoServer,
        };

        let server = UpgradeServer {
            inner: Arc::new(ServerInner {
                config,
                hooks,
                reactor,
                mode,
                tls,
                hook: Mutex::new(None),
                lifecycle: AtomicU8::new(RUNNING),
                close_callbacks: Mutex::new(Vec::new()),
                tracking: Mutex::new(Tracking::default()),
                events,
            }),
        };

        if let ServerMode::Port(listener) | ServerMode::Server(listener) = &server.inner.mode {
            let weak = Arc::downgrade(&server.inner);
            let hook = listener.on_connection(move |socket| {
                if let Some(inner) = weak.upgrade() {
                    UpgradeServer { inner }.drive(socket.clone());
                }
            });
            *lock(&server.inner.hook) = Some(hook);
        }

        info!(
            path = ?server.inner.config.path,
            client_tracking = server.inner.config.client_tracking,
            "Upgrade server started"
        );
        Ok((server, rx))
    }
}

/// Relay what the owned listener reports.
fn forward_listener_events(
    reactor: &Reactor,
    mut listener_events: UnboundedReceiver<ListenerEvent>,
    events: UnboundedSender<UpgradeEvent>,
) {
    reactor.handle().spawn(async move {
        while let Some(event) = listener_events.recv().await {
            match event {
                ListenerEvent::Listening(address) => {
                    let _ = events.send(UpgradeEvent::Listening(address));
                },
                ListenerEvent::Error(error) => {
                    let _ = events.send(UpgradeEvent::Error(error));
                },
                ListenerEvent::Drop(snapshot) => {
                    debug!(remote = ?snapshot.remote, "Connection dropped before handshake");
                },
                ListenerEvent::Connection(_) | ListenerEvent::Close => {},
            }
        }
    });
}

/// What the head reader saw.
enum HeadEvent {
    Complete { head: Bytes, rest: Bytes },
    TooLarge,
    Closed,
}

/// Position just past the blank line ending a request head.
fn head_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|at| at + 4)
}

impl UpgradeServer {
    /// Builder for a server with `config`.
    #[must_use]
    pub fn builder(config: UpgradeServerConfig) -> UpgradeServerBuilder {
        UpgradeServerBuilder {
            config,
            server: None,
            transport: None,
            reactor: None,
            tls: None,
            hooks: Hooks::default(),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> UpgradeState {
        match self.inner.lifecycle.load(Ordering::SeqCst) {
            RUNNING => UpgradeState::Running,
            CLOSING => UpgradeState::Closing,
            _ => UpgradeState::Closed,
        }
    }

    /// The server configuration.
    #[must_use]
    pub fn config(&self) -> &UpgradeServerConfig {
        &self.inner.config
    }

    /// How the server receives connections.
    #[must_use]
    pub fn mode(&self) -> &ServerMode {
        &self.inner.mode
    }

    /// The listener's bound address, `None` once it is gone.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::NoServerMode`] without a listener.
    pub fn address(&self) -> UpgradeResult<Option<SocketAddr>> {
        match &self.inner.mode {
            ServerMode::Port(listener) | ServerMode::Server(listener) => Ok(listener.address()),
            ServerMode::NoServer => Err(UpgradeError::NoServerMode),
        }
    }

    /// Live promoted clients, or `None` when tracking is disabled.
    #[must_use]
    pub fn clients(&self) -> Option<Vec<WebSocketClient>> {
        if !self.inner.config.client_tracking {
            return None;
        }
        Some(lock(&self.inner.tracking).clients.values().cloned().collect())
    }

    /// Whether the server handles `request`: the path filter if one is
    /// set, otherwise the configured path against the request pathname.
    #[must_use]
    pub fn should_handle(&self, request: &UpgradeRequest) -> bool {
        if let Some(filter) = &self.inner.hooks.path_filter {
            return filter(request);
        }
        self.inner
            .config
            .path
            .as_deref()
            .map_or(true, |path| request.path() == path)
    }

    fn client_options(&self) -> ClientOptions {
        let config = &self.inner.config;
        ClientOptions {
            max_payload: config.max_payload,
            skip_utf8_validation: config.skip_utf8_validation,
            per_message_deflate: config.per_message_deflate.options(),
        }
    }

    /// Run the handshake for `request`, answering on `exchange`.
    ///
    /// `callback` receives the promoted client, or the reason the request
    /// was refused after the refusal has been answered.
    pub fn handle_upgrade<F>(
        &self,
        request: UpgradeRequest,
        exchange: Box<dyn UpgradeExchange>,
        callback: F,
    ) where
        F: FnOnce(HandshakeResult<WebSocketClient>) + Send + 'static,
    {
        let callback: UpgradeCallback = Box::new(callback);
        if self.state() != UpgradeState::Running {
            self.abort(&request, exchange, HandshakeError::ServerNotRunning, callback);
            return;
        }

        let protocols = match self.validate(&request) {
            Ok(protocols) => protocols,
            Err(error) => {
                self.abort(&request, exchange, error, callback);
                return;
            },
        };

        let Some(verify) = self.inner.hooks.verify_client.clone() else {
            self.complete_upgrade(request, exchange, &protocols, callback);
            return;
        };

        let version = parse_version(request.version()).unwrap_or(13);
        let info = ClientInfo {
            origin: request.origin(version).map(str::to_string),
            secure: request.secure || exchange.is_secure(),
            request: request.clone(),
        };

        match verify {
            VerifyClient::Sync(verify) => {
                if verify(&info) {
                    self.complete_upgrade(request, exchange, &protocols, callback);
                } else {
                    let error = HandshakeError::Rejected {
                        code: 401,
                        message: None,
                        headers: Vec::new(),
                    };
                    self.abort(&request, exchange, error, callback);
                }
            },
            VerifyClient::Async(verify) => {
                let server = self.clone();
                let responder = VerifyResponder::new(move |verdict| match verdict {
                    Verdict::Accept => {
                        server.complete_upgrade(request, exchange, &protocols, callback);
                    },
                    Verdict::Reject {
                        code,
                        message,
                        headers,
                    } => {
                        let error = HandshakeError::Rejected {
                            code: code.unwrap_or(401),
                            message,
                            headers,
                        };
                        server.abort(&request, exchange, error, callback);
                    },
                });
                verify(info, responder);
            },
        }
    }

    fn validate(&self, request: &UpgradeRequest) -> HandshakeResult<SubprotocolSet> {
        if !validate_method(&request.method) {
            return Err(HandshakeError::InvalidMethod);
        }
        if !validate_upgrade_header(request.upgrade()) {
            return Err(HandshakeError::InvalidUpgradeHeader);
        }
        if !validate_key(request.key()) {
            return Err(HandshakeError::InvalidKey);
        }
        if parse_version(request.version()).is_none() {
            return Err(HandshakeError::InvalidVersion);
        }
        if !self.should_handle(request) {
            return Err(HandshakeError::PathRejected);
        }
        match request.protocol() {
            Some(header) => parse_subprotocols(header).map_err(|e| {
                debug!(error = %e, "Invalid subprotocol header");
                HandshakeError::InvalidSubprotocol
            }),
            None => Ok(SubprotocolSet::new()),
        }
    }

    fn complete_upgrade(
        &self,
        request: UpgradeRequest,
        mut exchange: Box<dyn UpgradeExchange>,
        protocols: &SubprotocolSet,
        callback: UpgradeCallback,
    ) {
        if self.state() != UpgradeState::Running {
            self.abort(&request, exchange, HandshakeError::ServerNotRunning, callback);
            return;
        }

        let protocol = if protocols.is_empty() {
            None
        } else {
            match &self.inner.hooks.handle_protocols {
                Some(select) => select(protocols, &request),
                None => protocols.first().map(str::to_string),
            }
        };
        if let Some(selected) = protocol.as_deref() {
            if !protocols.contains(selected) {
                warn!(protocol = selected, "Selector chose a subprotocol the client did not offer");
                let error = HandshakeError::UnknownSubprotocol(selected.to_string());
                self.abort(&request, exchange, error, callback);
                return;
            }
        }

        let Some(key) = request.key() else {
            self.abort(&request, exchange, HandshakeError::InvalidKey, callback);
            return;
        };

        let mut headers = upgrade_header_lines();
        if let Some(hook) = &self.inner.hooks.on_headers {
            hook(&mut headers, &request);
        }

        let client = WebSocketClient::new(request.url.clone(), protocol.clone(), self.client_options());
        let promotion = Promotion {
            key: key.to_string(),
            protocol,
            headers,
        };
        if !exchange.promote(&promotion, &client) {
            self.abort(&request, exchange, HandshakeError::PromotionFailed, callback);
            return;
        }

        if self.inner.config.client_tracking {
            self.track(&client);
        }
        info!(
            client_id = client.id(),
            path = request.path(),
            protocol = ?client.protocol(),
            "Connection upgraded"
        );
        callback(Ok(client));
    }

    fn abort(
        &self,
        request: &UpgradeRequest,
        mut exchange: Box<dyn UpgradeExchange>,
        error: HandshakeError,
        callback: UpgradeCallback,
    ) {
        debug!(
            code = error.status_code(),
            path = request.path(),
            error = %error,
            "Upgrade rejected"
        );
        match &self.inner.hooks.on_client_error {
            Some(hook) => hook(&error, exchange, request),
            None => exchange.respond(abort_response(
                error.status_code(),
                Some(&error.message()),
                error.headers(),
            )),
        }
        callback(Err(error));
    }

    fn track(&self, client: &WebSocketClient) {
        lock(&self.inner.tracking)
            .clients
            .insert(client.id(), client.clone());

        let weak = Arc::downgrade(&self.inner);
        let id = client.id();
        client.on_close(move || {
            if let Some(inner) = weak.upgrade() {
                UpgradeServer { inner }.untrack(id);
            }
        });
    }

    fn untrack(&self, id: u64) {
        let mut tracking = lock(&self.inner.tracking);
        tracking.clients.remove(&id);
        if tracking.close_when_empty && tracking.clients.is_empty() {
            tracking.close_when_empty = false;
            drop(tracking);
            self.schedule_finish();
        }
    }

    /// Stop accepting handshakes and close.
    ///
    /// With an owned listener the close completes once the listener stops
    /// and every connection it accepted has closed.
    /// Otherwise the listener hook is detached and, with client tracking,
    /// the close waits for the last tracked client; with none left it
    /// completes on the next reactor turn. Closing a closed server reports
    /// [`UpgradeError::NotRunning`] on the next reactor turn. Every close
    /// request is followed by one [`UpgradeEvent::Close`].
    pub fn close<F>(&self, callback: F)
    where
        F: FnOnce(UpgradeResult<()>) + Send + 'static,
    {
        {
            let mut callbacks = lock(&self.inner.close_callbacks);
            match self.inner.lifecycle.load(Ordering::SeqCst) {
                CLOSED => {
                    drop(callbacks);
                    let events = self.inner.events.clone();
                    self.inner.reactor.defer(move || {
                        callback(Err(UpgradeError::NotRunning));
                        let _ = events.send(UpgradeEvent::Close);
                    });
                    return;
                },
                CLOSING => {
                    callbacks.push(Box::new(callback));
                    return;
                },
                _ => {},
            }
            self.inner.lifecycle.store(CLOSING, Ordering::SeqCst);
            callbacks.push(Box::new(callback));
        }

        info!("Upgrade server closing");
        match &self.inner.mode {
            ServerMode::Port(listener) => {
                self.detach(listener);
                let server = self.clone();
                listener.close(move |_| server.finish_close());
            },
            ServerMode::Server(listener) => {
                self.detach(listener);
                self.close_when_drained();
            },
            ServerMode::NoServer => self.close_when_drained(),
        }
    }

    fn detach(&self, listener: &ListenerServer) {
        if let Some(hook) = lock(&self.inner.hook).take() {
            listener.remove_hook(hook);
        }
    }

    fn close_when_drained(&self) {
        if self.inner.config.client_tracking {
            let mut tracking = lock(&self.inner.tracking);
            if !tracking.clients.is_empty() {
                debug!(clients = tracking.clients.len(), "Waiting for clients to close");
                tracking.close_when_empty = true;
                return;
            }
        }
        self.schedule_finish();
    }

    fn schedule_finish(&self) {
        let server = self.clone();
        self.inner.reactor.defer(move || server.finish_close());
    }

    fn finish_close(&self) {
        let callbacks = {
            let mut callbacks = lock(&self.inner.close_callbacks);
            self.inner.lifecycle.store(CLOSED, Ordering::SeqCst);
            std::mem::take(&mut *callbacks)
        };

        info!("Upgrade server closed");
        for callback in callbacks {
            callback(Ok(()));
        }
        let _ = self.inner.events.send(UpgradeEvent::Close);
    }

    /// Read the request head from a freshly accepted socket and run the
    /// handshake on it.
    fn drive(&self, socket: StreamSocket) {
        if let Some(tls) = &self.inner.tls {
            if let Err(e) = socket.upgrade_to_tls(tls) {
                warn!(socket_id = socket.id(), error = %e, "TLS upgrade failed");
                return;
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let max_head = self.inner.config.max_handshake_size;

        let closed = tx.clone();
        socket.on_closed(move || {
            let _ = closed.send(HeadEvent::Closed);
        });

        let mut buffer = BytesMut::new();
        let mut done = false;
        socket.set_consumer(move |chunk| {
            if done {
                return false;
            }
            let data = match chunk {
                ReadChunk::Data(data) => data,
                ReadChunk::End => {
                    done = true;
                    let _ = tx.send(HeadEvent::Closed);
                    return false;
                },
            };
            buffer.extend_from_slice(&data);
            match head_end(&buffer) {
                Some(end) if end <= max_head => {
                    done = true;
                    let rest = buffer.split_off(end).freeze();
                    let head = std::mem::take(&mut buffer).freeze();
                    let _ = tx.send(HeadEvent::Complete { head, rest });
                    false
                },
                Some(_) => {
                    done = true;
                    let _ = tx.send(HeadEvent::TooLarge);
                    false
                },
                None if buffer.len() > max_head => {
                    done = true;
                    let _ = tx.send(HeadEvent::TooLarge);
                    false
                },
                None => true,
            }
        });

        let settled = Arc::new(AtomicBool::new(false));
        if let Some(timeout) = self.inner.config.handshake_timeout {
            let socket = socket.clone();
            let settled = Arc::clone(&settled);
            self.inner.reactor.handle().spawn(async move {
                tokio::time::sleep(timeout).await;
                if !settled.load(Ordering::SeqCst) && !socket.is_closed() {
                    debug!(socket_id = socket.id(), "Handshake timed out");
                    socket.destroy(None);
                }
            });
        }

        let server = self.clone();
        self.inner.reactor.handle().spawn(async move {
            let (head, rest) = match rx.recv().await {
                Some(HeadEvent::Complete { head, rest }) => (head, rest),
                Some(HeadEvent::TooLarge) => {
                    debug!(socket_id = socket.id(), "Request head too large");
                    let mut exchange = SocketExchange::with_settled(socket, Bytes::new(), settled);
                    exchange.respond(abort_response(431, None, &[]));
                    return;
                },
                Some(HeadEvent::Closed) | None => return,
            };
            drop(rx);
            socket.clear_consumer();

            let mut exchange = SocketExchange::with_settled(socket.clone(), rest, settled);
            let request = match UpgradeRequest::parse(&head) {
                Ok(request) => request.secure(socket.is_secure()),
                Err(e) => {
                    debug!(socket_id = socket.id(), error = %e, "Malformed request head");
                    exchange.respond(abort_response(400, None, &[]));
                    return;
                },
            };
            if !request.is_upgrade() {
                debug!(socket_id = socket.id(), path = request.path(), "Not an upgrade request");
                exchange.respond(upgrade_required_response());
                return;
            }

            let events = server.inner.events.clone();
            server.handle_upgrade(request, Box::new(exchange), move |result| {
                if let Ok(client) = result {
                    let _ = events.send(UpgradeEvent::Connection(client));
                }
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_end() {
        assert_eq!(head_end(b"GET / HTTP/1.1\r\n\r\n"), Some(18));
        assert_eq!(head_end(b"GET / HTTP/1.1\r\nHost: x\r\n"), None);
        assert_eq!(head_end(b"a\r\n\r\nrest"), Some(5));
    }

    #[tokio::test]
    async fn test_build_requires_one_mode() {
        assert!(matches!(
            UpgradeServer::builder(UpgradeServerConfig::default()).build(),
            Err(UpgradeError::ConflictingModes)
        ));
    }

    #[tokio::test]
    async fn test_no_server_address_errors() {
        let (server, _events) = UpgradeServer::builder(UpgradeServerConfig::default().no_server())
            .build()
            .unwrap();
        assert!(matches!(server.address(), Err(UpgradeError::NoServerMode)));
        assert_eq!(server.state(), UpgradeState::Running);
        assert_eq!(server.clients(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_should_handle_path() {
        let (server, _events) = UpgradeServer::builder(
            UpgradeServerConfig::default().no_server().path("/chat"),
        )
        .build()
        .unwrap();
        assert!(server.should_handle(&UpgradeRequest::new("GET", "/chat?x=1")));
        assert!(!server.should_handle(&UpgradeRequest::new("GET", "/other")));
    }

    #[tokio::test]
    async fn test_path_filter_overrides_path() {
        let (server, _events) = UpgradeServer::builder(
            UpgradeServerConfig::default().no_server().path("/chat"),
        )
        .path_filter(|request| request.path().starts_with("/rooms/"))
        .build()
        .unwrap();
        assert!(server.should_handle(&UpgradeRequest::new("GET", "/rooms/1")));
        assert!(!server.should_handle(&UpgradeRequest::new("GET", "/chat")));
    }

    #[tokio::test]
    async fn test_close_without_clients_is_deferred() {
        let (server, mut events) =
            UpgradeServer::builder(UpgradeServerConfig::default().no_server())
                .build()
                .unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        server.close(move |result| {
            let _ = tx.send(result.is_ok());
        });
        assert_eq!(server.state(), UpgradeState::Closing);
        assert!(rx.await.unwrap());
        assert!(matches!(events.recv().await, Some(UpgradeEvent::Close)));
        assert_eq!(server.state(), UpgradeState::Closed);
    }
}
