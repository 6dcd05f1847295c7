//! Event-driven byte-stream transports.
//!
//! The [`contract`] module defines what the socket layer expects from a
//! transport. Two implementations ship with the crate:
//!
//! - [`TcpTransport`]: tokio TCP with in-place TLS upgrades via rustls
//! - [`MemoryTransport`]: deterministic in-process connections
//!
//! # Example
//!
//! ```ignore
//! use r0n_upgrade::modules::transport::{Reactor, TcpTransport};
//!
//! let transport = TcpTransport::new(Reactor::current()?);
//! ```

mod contract;
mod error;
mod memory;
mod reactor;
mod tcp;
mod tls;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use contract::{
    Acceptor, AddressFamily, ConnectOptions, Connection, ListenOptions, Listener, Transport,
    TransportEvents,
};
pub use error::{TransportError, TransportResult};
pub use memory::{
    MemoryConnection, MemoryConnectionHandle, MemoryListener, MemoryListenerHandle,
    MemoryTransport,
};
pub use reactor::Reactor;
pub use tcp::{TcpConnection, TcpTransport};
pub use tls::{load_certificates, load_private_key, TlsOptions, TlsRole};

/// Lock `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
