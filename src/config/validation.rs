//! Configuration validation system.

use super::types::ServiceConfig;

/// A single validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// Error message.
    pub message: String,
    /// Severity level.
    pub severity: ValidationSeverity,
}

impl ValidationError {
    /// Create a new error.
    pub fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: ValidationSeverity::Error,
        }
    }

    /// Create a new warning.
    pub fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: ValidationSeverity::Warning,
        }
    }
}

/// Severity of validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSeverity {
    /// Error - configuration is invalid.
    Error,
    /// Warning - configuration may have issues.
    Warning,
}

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    errors: Vec<ValidationError>,
}

impl ValidationResult {
    /// Create a new empty (valid) result.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an error to the result.
    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Check if the validation passed (no errors).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self
            .errors
            .iter()
            .any(|e| e.severity == ValidationSeverity::Error)
    }

    /// Get all validation issues.
    #[must_use]
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Get only errors (not warnings).
    #[must_use]
    pub fn errors_only(&self) -> Vec<&ValidationError> {
        self.errors
            .iter()
            .filter(|e| e.severity == ValidationSeverity::Error)
            .collect()
    }

    /// Get only warnings.
    #[must_use]
    pub fn warnings(&self) -> Vec<&ValidationError> {
        self.errors
            .iter()
            .filter(|e| e.severity == ValidationSeverity::Warning)
            .collect()
    }
}

/// Trait for configuration validators.
pub trait Validator: std::fmt::Debug + Send + Sync {
    /// Validate a configuration and return any errors.
    fn validate(&self, config: &ServiceConfig) -> ValidationResult;
}

/// Built-in validator for basic configuration checks.
#[derive(Debug, Default)]
pub struct BasicValidator;

impl BasicValidator {
    /// Create a new basic validator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Validator for BasicValidator {
    fn validate(&self, config: &ServiceConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        if config.service.name.is_empty() {
            result.add_error(ValidationError::error(
                "service.name",
                "Service name cannot be empty",
            ));
        }

        result
    }
}

/// Validator for the `[websocket]` and `[tls]` sections.
///
/// The binary always runs a listener, so a server supplied in code is never
/// counted as a listener mode here.
#[derive(Debug, Default)]
pub struct WebSocketValidator;

impl WebSocketValidator {
    /// Create a new WebSocket validator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Validator for WebSocketValidator {
    fn validate(&self, config: &ServiceConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        let websocket = &config.websocket;

        if let Err(e) = websocket.validate(false) {
            result.add_error(ValidationError::error("websocket", e.to_string()));
        }

        if websocket.no_server && websocket.max_connections > 0 {
            result.add_error(ValidationError::warning(
                "websocket.max_connections",
                "max_connections has no effect without a listener",
            ));
        }

        if let Some(tls) = &config.tls {
            if websocket.no_server {
                result.add_error(ValidationError::warning(
                    "tls",
                    "TLS settings have no effect without a listener",
                ));
            }
            for (field, path) in [("tls.cert_path", &tls.cert_path), ("tls.key_path", &tls.key_path)] {
                if path.as_os_str().is_empty() {
                    result.add_error(ValidationError::error(field, "Path cannot be empty"));
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;
    use std::path::PathBuf;

    fn listening() -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.websocket.port = Some(8080);
        config
    }

    #[test]
    fn test_basic_validator_valid() {
        let result = BasicValidator::new().validate(&ServiceConfig::default());
        assert!(result.is_valid());
    }

    #[test]
    fn test_basic_validator_empty_name() {
        let mut config = ServiceConfig::default();
        config.service.name = String::new();

        let result = BasicValidator::new().validate(&config);
        assert!(!result.is_valid());
        assert!(result.errors()[0].message.contains("name cannot be empty"));
    }

    #[test]
    fn test_websocket_validator_valid() {
        let result = WebSocketValidator::new().validate(&listening());
        assert!(result.is_valid());
        assert!(result.errors().is_empty());
    }

    #[test]
    fn test_websocket_validator_requires_one_mode() {
        let result = WebSocketValidator::new().validate(&ServiceConfig::default());
        assert!(!result.is_valid());
        assert!(result.errors()[0].message.contains("One and only one"));
    }

    #[test]
    fn test_websocket_validator_bad_path() {
        let mut config = listening();
        config.websocket.path = Some("ws".to_string());
        let result = WebSocketValidator::new().validate(&config);
        assert!(!result.is_valid());
    }

    #[test]
    fn test_websocket_validator_warnings() {
        let mut config = ServiceConfig::default();
        config.websocket.no_server = true;
        config.websocket.max_connections = 10;
        config.tls = Some(TlsConfig {
            cert_path: PathBuf::from("cert.pem"),
            key_path: PathBuf::from("key.pem"),
        });

        let result = WebSocketValidator::new().validate(&config);
        assert!(result.is_valid());
        assert_eq!(result.warnings().len(), 2);
    }

    #[test]
    fn test_websocket_validator_empty_tls_path() {
        let mut config = listening();
        config.tls = Some(TlsConfig {
            cert_path: PathBuf::new(),
            key_path: PathBuf::from("key.pem"),
        });
        let result = WebSocketValidator::new().validate(&config);
        assert_eq!(result.errors_only().len(), 1);
        assert_eq!(result.errors_only()[0].field, "tls.cert_path");
    }
}
