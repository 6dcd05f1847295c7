//! Duplex stream sockets.
//!
//! A [`StreamSocket`] wraps one transport [`Connection`](crate::modules::transport::Connection)
//! and adds what the raw handle lacks:
//!
//! - an inbound [`ConnectionQueue`] for data that arrives before anyone reads
//! - single-outstanding-write backpressure with drain retries
//! - byte counters, idle timeout and reference forwarding
//! - in-place TLS upgrades

mod error;
mod queue;
mod socket;

pub use error::{SocketError, SocketResult};
pub use queue::{ConnectionQueue, ReadChunk};
pub use socket::{Consumer, Endpoint, ReadyState, SocketEvent, StreamSocket, WriteCallback};
