//! Listener server configuration.

use serde::{Deserialize, Serialize};

/// Configuration for a [`ListenerServer`](super::ListenerServer).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerServerConfig {
    /// Maximum concurrent connections (0 = unlimited). Connections over the
    /// limit are ended and reported as drops.
    pub max_connections: usize,

    /// Start accepted sockets paused.
    pub pause_on_connect: bool,
}

impl ListenerServerConfig {
    /// Limit concurrent connections.
    #[must_use]
    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Start accepted sockets paused.
    #[must_use]
    pub fn pause_on_connect(mut self, pause: bool) -> Self {
        self.pause_on_connect = pause;
        self
    }

    /// Whether `current` live connections leave room for one more.
    #[must_use]
    pub fn has_capacity(&self, current: usize) -> bool {
        self.max_connections == 0 || current < self.max_connections
    }
}
