//! Handle to a promoted connection.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::debug;

use super::config::DeflateOptions;
use crate::modules::stream_socket::StreamSocket;
use crate::modules::transport::lock;

/// Global client ID counter.
static CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Settings a promoted connection frames messages with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Largest accepted message, in bytes.
    pub max_payload: usize,
    /// Skip UTF-8 validation of text messages.
    pub skip_utf8_validation: bool,
    /// Negotiable compression parameters, if enabled.
    pub per_message_deflate: Option<DeflateOptions>,
}

struct ClientState {
    socket: Option<StreamSocket>,
    head: Bytes,
    closed: bool,
    close_hooks: Vec<Box<dyn FnOnce() + Send>>,
}

struct ClientInner {
    id: u64,
    url: String,
    protocol: Option<String>,
    options: ClientOptions,
    state: Mutex<ClientState>,
}

/// A connection that completed the upgrade handshake.
///
/// Message framing happens outside this crate; the client owns the socket
/// and whatever bytes followed the request head. Cheap to clone.
#[derive(Clone)]
pub struct WebSocketClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for WebSocketClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketClient")
            .field("id", &self.inner.id)
            .field("url", &self.inner.url)
            .field("protocol", &self.inner.protocol)
            .field("closed", &self.state().closed)
            .finish()
    }
}

impl PartialEq for WebSocketClient {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for WebSocketClient {}

impl WebSocketClient {
    /// A client for a request to `url` speaking `protocol`.
    #[must_use]
    pub fn new(url: impl Into<String>, protocol: Option<String>, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                id: CLIENT_ID.fetch_add(1, Ordering::Relaxed),
                url: url.into(),
                protocol,
                options,
                state: Mutex::new(ClientState {
                    socket: None,
                    head: Bytes::new(),
                    closed: false,
                    close_hooks: Vec::new(),
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        lock(&self.inner.state)
    }

    /// Unique client ID.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Request target of the upgrade.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Negotiated subprotocol.
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.inner.protocol.as_deref()
    }

    /// Framing settings.
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// The promoted socket, once attached.
    #[must_use]
    pub fn socket(&self) -> Option<StreamSocket> {
        self.state().socket.clone()
    }

    /// Bytes received after the request head.
    #[must_use]
    pub fn head(&self) -> Bytes {
        self.state().head.clone()
    }

    /// Whether the client has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Hand the promoted socket and trailing bytes to the client.
    pub fn attach(&self, socket: StreamSocket, head: Bytes) {
        let mut state = self.state();
        state.socket = Some(socket);
        state.head = head;
    }

    /// Run `hook` once the client closes. Runs immediately if it already has.
    pub fn on_close<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state();
        if state.closed {
            drop(state);
            hook();
            return;
        }
        state.close_hooks.push(Box::new(hook));
    }

    /// Close the client, ending its socket.
    pub fn close(&self) {
        let socket = self.state().socket.clone();
        match socket {
            Some(socket) => socket.end(),
            None => self.mark_closed(),
        }
    }

    /// Record the close and run close hooks once.
    pub(crate) fn mark_closed(&self) {
        let hooks = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.close_hooks)
        };
        debug!(client_id = self.inner.id, "Client closed");
        for hook in hooks {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn options() -> ClientOptions {
        ClientOptions {
            max_payload: 1024,
            skip_utf8_validation: false,
            per_message_deflate: None,
        }
    }

    #[test]
    fn test_unique_ids() {
        let a = WebSocketClient::new("/", None, options());
        let b = WebSocketClient::new("/", None, options());
        assert_ne!(a.id(), b.id());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_close_without_socket_runs_hooks_once() {
        let client = WebSocketClient::new("/chat", Some("chat".into()), options());
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        client.on_close(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        client.close();
        client.close();
        assert!(client.is_closed());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let c = Arc::clone(&count);
        client.on_close(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(client.protocol(), Some("chat"));
    }
}
