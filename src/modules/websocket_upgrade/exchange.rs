//! The promotion primitive: answering a handshake on the wire.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::client::WebSocketClient;
use super::response::switching_protocols;
use crate::modules::stream_socket::StreamSocket;

/// Everything needed to answer a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    /// Client `Sec-WebSocket-Key`.
    pub key: String,
    /// Selected subprotocol.
    pub protocol: Option<String>,
    /// Status line and headers, after the headers hook ran.
    pub headers: Vec<String>,
}

/// The connection a handshake is answered on.
///
/// Each exchange settles once: either [`respond`](Self::respond) or a
/// successful [`promote`](Self::promote). Later calls are ignored and
/// `promote` returns `false`.
pub trait UpgradeExchange: Send {
    /// Write a complete non-upgrade response and end the connection.
    fn respond(&mut self, response: Vec<u8>);

    /// Switch protocols and hand the connection to `client`.
    fn promote(&mut self, promotion: &Promotion, client: &WebSocketClient) -> bool;

    /// Whether the connection is TLS.
    fn is_secure(&self) -> bool;
}

/// [`UpgradeExchange`] over a [`StreamSocket`].
pub struct SocketExchange {
    socket: StreamSocket,
    head: Bytes,
    settled: Arc<AtomicBool>,
}

impl fmt::Debug for SocketExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketExchange")
            .field("socket", &self.socket.id())
            .field("head", &self.head.len())
            .field("settled", &self.settled.load(Ordering::SeqCst))
            .finish()
    }
}

impl SocketExchange {
    /// Answer on `socket`. `head` holds bytes read past the request head.
    #[must_use]
    pub fn new(socket: StreamSocket, head: Bytes) -> Self {
        Self {
            socket,
            head,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the exchange has been answered.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Like [`new`](Self::new), reporting settlement through `settled`.
    pub(crate) fn with_settled(socket: StreamSocket, head: Bytes, settled: Arc<AtomicBool>) -> Self {
        Self {
            socket,
            head,
            settled,
        }
    }
}

impl UpgradeExchange for SocketExchange {
    fn respond(&mut self, response: Vec<u8>) {
        if self.settled.swap(true, Ordering::SeqCst) {
            warn!(socket_id = self.socket.id(), "Handshake already answered");
            return;
        }
        let socket_id = self.socket.id();
        self.socket.write(response, move |result| {
            if let Err(e) = result {
                debug!(socket_id, error = %e, "Abort response not delivered");
            }
        });
        self.socket.end();
    }

    fn promote(&mut self, promotion: &Promotion, client: &WebSocketClient) -> bool {
        if self.socket.is_closed() || self.settled.swap(true, Ordering::SeqCst) {
            return false;
        }

        let response = switching_protocols(
            &promotion.headers,
            &promotion.key,
            promotion.protocol.as_deref(),
        );
        let socket_id = self.socket.id();
        self.socket.write(response, move |result| {
            if let Err(e) = result {
                debug!(socket_id, error = %e, "Upgrade response not delivered");
            }
        });

        client.attach(self.socket.clone(), std::mem::take(&mut self.head));
        let closed = client.clone();
        self.socket.on_closed(move || closed.mark_closed());
        true
    }

    fn is_secure(&self) -> bool {
        self.socket.is_secure()
    }
}
