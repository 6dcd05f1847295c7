//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::modules::websocket_upgrade::UpgradeServerConfig;

/// Root configuration structure for the upgrade service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service identity.
    pub service: ServiceSection,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// WebSocket upgrade server configuration.
    pub websocket: UpgradeServerConfig,

    /// TLS for accepted connections. Plain TCP when absent.
    pub tls: Option<TlsConfig>,
}

/// Service section configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    /// Service instance name.
    pub name: String,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: "r0n-upgrade".to_string(),
        }
    }
}

/// The `[logging]` section. `RUST_LOG` overrides `level` when set.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum level emitted.
    pub level: LogLevel,

    /// Line format.
    pub format: LogFormat,

    /// Stream the log lines go to.
    pub output: LogOutput,
}

/// Minimum log level, spelled the way `tracing` filter directives are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Everything, including per-chunk socket traces.
    Trace,
    /// Handshake rejections and connection lifecycle.
    Debug,
    /// Listener, upgrade and shutdown milestones.
    #[default]
    Info,
    /// Dropped connections and recoverable failures.
    Warn,
    /// Fatal failures only.
    Error,
}

impl LogLevel {
    /// The filter directive for this level.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Line format of the fmt subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Multi-line, colored.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
}

/// Where log lines are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// Standard output.
    #[default]
    Stdout,
    /// Standard error.
    Stderr,
}

/// Server certificate for TLS listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain.
    pub cert_path: PathBuf,

    /// PEM private key.
    pub key_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_service_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.service.name, "r0n-upgrade");
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.websocket.client_tracking);
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_log_level_directive() {
        assert_eq!(LogLevel::Warn.to_string(), "warn");
        assert_eq!(LogLevel::default().as_str(), "info");
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml_str = r#"
            [service]
            name = "edge-ws"
        "#;

        let config: ServiceConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.service.name, "edge-ws");
        assert_eq!(config.websocket.port, None);
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
            [service]
            name = "full"

            [logging]
            level = "debug"
            format = "json"
            output = "stderr"

            [websocket]
            port = 8080
            host = "127.0.0.1"
            path = "/ws"
            max_connections = 100
            handshake_timeout = "10s"

            [tls]
            cert_path = "/etc/r0n/cert.pem"
            key_path = "/etc/r0n/key.pem"
        "#;

        let config: ServiceConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.output, LogOutput::Stderr);
        assert_eq!(config.websocket.port, Some(8080));
        assert_eq!(config.websocket.max_connections, 100);
        assert_eq!(
            config.tls.unwrap().cert_path,
            PathBuf::from("/etc/r0n/cert.pem")
        );
    }
}
