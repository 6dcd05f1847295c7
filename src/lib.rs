//! # R0N Upgrade
//!
//! The connection and protocol-upgrade layer of the R0N gateway family.
//!
//! ## Features
//!
//! - Duplex stream sockets over pluggable transports (TCP, in-memory)
//! - Single-outstanding-write backpressure and in-place TLS upgrades
//! - A listener server with a connection limit and graceful drain-close
//! - The RFC 6455 upgrade handshake with client verification hooks
//!
//! ## Architecture
//!
//! Components build on each other leaf to root:
//! [`modules::transport`] → [`modules::stream_socket`] →
//! [`modules::listener`] → [`modules::websocket_upgrade`]. Every component
//! schedules its deferred work on one [`modules::transport::Reactor`].

pub mod config;
pub mod modules;
