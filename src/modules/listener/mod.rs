//! Listener server.
//!
//! Accepts connections from a transport listener (owned or attached) or
//! from the caller directly, wraps each in a
//! [`StreamSocket`](crate::modules::stream_socket::StreamSocket), caps the
//! number of live connections and supports a graceful drain-close.

mod config;
mod error;
mod server;

pub use config::ListenerServerConfig;
pub use error::{ListenerError, ListenerResult};
pub use server::{
    DropSnapshot, HookId, ListenerEvent, ListenerMode, ListenerServer, ListenerState,
};
