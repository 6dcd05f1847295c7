//! # Configuration System
//!
//! TOML-based configuration for the upgrade service: parsing and
//! validation.
//!
//! ## Example Configuration
//!
//! ```toml
//! [service]
//! name = "edge-ws"
//!
//! [logging]
//! level = "info"
//! format = "json"
//!
//! [websocket]
//! port = 8080
//! path = "/ws"
//! max_connections = 1000
//! handshake_timeout = "10s"
//! per_message_deflate = true
//! ```

mod error;
mod loader;
mod types;
mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use types::{
    LogFormat, LogLevel, LogOutput, LoggingConfig, ServiceConfig, ServiceSection, TlsConfig,
};
pub use validation::{
    BasicValidator, ValidationError, ValidationResult, ValidationSeverity, Validator,
    WebSocketValidator,
};
