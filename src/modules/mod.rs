//! # Upgrade Layer Modules
//!
//! ## Available Modules
//!
//! - [`transport`] - Transport contract with TCP and in-memory bindings
//! - [`stream_socket`] - Duplex stream sockets with backpressure and TLS upgrade
//! - [`listener`] - Connection-limited listener server with graceful close
//! - [`websocket_upgrade`] - WebSocket upgrade handshake server

pub mod listener;
pub mod stream_socket;
pub mod transport;
pub mod websocket_upgrade;
