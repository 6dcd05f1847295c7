//! Upgrade server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{UpgradeError, UpgradeResult};

/// Default maximum message size (100 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 100 * 1024 * 1024;

/// Default limit for a request head read by the built-in driver.
pub const DEFAULT_MAX_HANDSHAKE_SIZE: usize = 8192;

/// Upgrade server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeServerConfig {
    /// Largest message promoted connections accept, in bytes.
    pub max_payload: usize,

    /// Skip UTF-8 validation of text messages.
    pub skip_utf8_validation: bool,

    /// Per-message compression. `true` enables it with default parameters.
    pub per_message_deflate: PerMessageDeflate,

    /// Track promoted connections so `close` can wait for them.
    pub client_tracking: bool,

    /// Only accept upgrades for this path.
    pub path: Option<String>,

    /// Bind a listener on this port.
    pub port: Option<u16>,

    /// Host for the bound listener.
    pub host: Option<String>,

    /// Pending-connection queue length for the bound listener.
    pub backlog: Option<u32>,

    /// Do not listen at all; requests are fed through `handle_upgrade`.
    pub no_server: bool,

    /// Maximum concurrent connections on the bound listener (0 = unlimited).
    pub max_connections: usize,

    /// Largest request head the built-in driver reads, in bytes.
    pub max_handshake_size: usize,

    /// Destroy connections that have not finished the handshake by then.
    #[serde(default, with = "humantime_serde")]
    pub handshake_timeout: Option<Duration>,
}

impl Default for UpgradeServerConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            skip_utf8_validation: false,
            per_message_deflate: PerMessageDeflate::default(),
            client_tracking: true,
            path: None,
            port: None,
            host: None,
            backlog: None,
            no_server: false,
            max_connections: 0,
            max_handshake_size: DEFAULT_MAX_HANDSHAKE_SIZE,
            handshake_timeout: None,
        }
    }
}

impl UpgradeServerConfig {
    /// Listen on `port`.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the host for the bound listener.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Run without a listener.
    #[must_use]
    pub fn no_server(mut self) -> Self {
        self.no_server = true;
        self
    }

    /// Only accept upgrades for `path`.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Enable or disable client tracking.
    #[must_use]
    pub fn client_tracking(mut self, enabled: bool) -> Self {
        self.client_tracking = enabled;
        self
    }

    /// Limit concurrent connections on the bound listener.
    #[must_use]
    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Check the configuration. `has_server` says whether a listener
    /// server is supplied alongside it.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::ConflictingModes`] unless exactly one of
    /// `port`, a supplied server and `no_server` is set, and
    /// [`UpgradeError::Config`] for other invalid values.
    pub fn validate(&self, has_server: bool) -> UpgradeResult<()> {
        let modes = [self.port.is_some(), has_server, self.no_server];
        if modes.iter().filter(|&&set| set).count() != 1 {
            return Err(UpgradeError::ConflictingModes);
        }
        if self.max_payload == 0 {
            return Err(UpgradeError::Config("max_payload must be positive".into()));
        }
        if self.max_handshake_size == 0 {
            return Err(UpgradeError::Config(
                "max_handshake_size must be positive".into(),
            ));
        }
        if let Some(path) = &self.path {
            if !path.starts_with('/') {
                return Err(UpgradeError::Config(format!(
                    "path must start with '/': {path}"
                )));
            }
        }
        Ok(())
    }
}

/// `per_message_deflate` setting: a switch or explicit parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PerMessageDeflate {
    /// Enabled with defaults, or disabled.
    Enabled(bool),
    /// Enabled with these parameters.
    Options(DeflateOptions),
}

impl Default for PerMessageDeflate {
    fn default() -> Self {
        Self::Enabled(false)
    }
}

impl PerMessageDeflate {
    /// Effective parameters, or `None` when disabled.
    #[must_use]
    pub fn options(&self) -> Option<DeflateOptions> {
        match self {
            Self::Enabled(false) => None,
            Self::Enabled(true) => Some(DeflateOptions::default()),
            Self::Options(options) => Some(options.clone()),
        }
    }
}

/// Per-message compression parameters handed to promoted connections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeflateOptions {
    /// Do not reuse the server compression context between messages.
    pub server_no_context_takeover: bool,

    /// Ask the client not to reuse its compression context.
    pub client_no_context_takeover: bool,

    /// Server LZ77 window size (8..=15).
    pub server_max_window_bits: Option<u8>,

    /// Client LZ77 window size (8..=15).
    pub client_max_window_bits: Option<u8>,

    /// Messages smaller than this are not compressed.
    pub threshold: Option<usize>,
}
