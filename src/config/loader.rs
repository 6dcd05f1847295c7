//! Reading and writing the service configuration file.

use std::path::Path;

use tracing::{debug, warn};

use super::error::{ConfigError, ConfigResult};
use super::types::ServiceConfig;
use super::validation::Validator;

/// Parses TOML into a [`ServiceConfig`] and runs the registered validators.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    validators: Vec<Box<dyn Validator>>,
}

impl ConfigLoader {
    /// A loader without validators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a validator. Validators run in registration order.
    #[must_use]
    pub fn with_validator<V: Validator + 'static>(mut self, validator: V) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    /// Read and parse `path` without validating it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] for a missing file, otherwise a
    /// read or parse error.
    pub fn read<P: AsRef<Path>>(&self, path: P) -> ConfigResult<ServiceConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        debug!(path = %path.display(), bytes = content.len(), "Configuration read");
        Ok(toml::from_str(&content)?)
    }

    /// Read, parse and validate `path`.
    ///
    /// # Errors
    ///
    /// Everything [`read`](Self::read) returns, plus
    /// [`ConfigError::Invalid`] when a validator reports errors.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> ConfigResult<ServiceConfig> {
        let config = self.read(path)?;
        self.validate(&config)?;
        Ok(config)
    }

    /// Parse and validate TOML text.
    ///
    /// # Errors
    ///
    /// Returns a parse error or [`ConfigError::Invalid`].
    pub fn load_str(&self, content: &str) -> ConfigResult<ServiceConfig> {
        let config: ServiceConfig = toml::from_str(content)?;
        self.validate(&config)?;
        Ok(config)
    }

    /// Run every validator. Warnings are logged; errors from all validators
    /// are collected into one [`ConfigError::Invalid`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if any validator reports an error.
    pub fn validate(&self, config: &ServiceConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();
        for validator in &self.validators {
            let result = validator.validate(config);
            for warning in result.warnings() {
                warn!(field = %warning.field, "{}", warning.message);
            }
            errors.extend(
                result
                    .errors_only()
                    .into_iter()
                    .map(|e| format!("{}: {}", e.field, e.message)),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Write `config` to `path` as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn save<P: AsRef<Path>>(&self, config: &ServiceConfig, path: P) -> ConfigResult<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(config)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BasicValidator, WebSocketValidator};
    use tempfile::tempdir;

    fn loader() -> ConfigLoader {
        ConfigLoader::new()
            .with_validator(BasicValidator::new())
            .with_validator(WebSocketValidator::new())
    }

    #[test]
    fn test_load_str_without_validators() {
        let config = ConfigLoader::new()
            .load_str("[service]\nname = \"edge\"\n")
            .unwrap();
        assert_eq!(config.service.name, "edge");
    }

    #[test]
    fn test_load_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("upgrade.toml");
        std::fs::write(&path, "[websocket]\nport = 9000\npath = \"/ws\"\n").unwrap();

        let config = loader().load(&path).unwrap();
        assert_eq!(config.websocket.port, Some(9000));
        assert_eq!(config.websocket.path.as_deref(), Some("/ws"));
    }

    #[test]
    fn test_missing_file() {
        let result = loader().load("/nonexistent/upgrade.toml");
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_read_skips_validation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("upgrade.toml");
        std::fs::write(&path, "[websocket]\nport = 9000\nno_server = true\n").unwrap();

        assert!(loader().read(&path).is_ok());
        assert!(matches!(loader().load(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_errors_from_all_validators_are_collected() {
        let result = loader().load_str("[service]\nname = \"\"\n\n[websocket]\npath = \"ws\"\n");
        let Err(ConfigError::Invalid(errors)) = result else {
            panic!("expected validation errors");
        };
        assert!(errors.len() >= 2);
        assert!(errors[0].starts_with("service.name: "));
        assert!(errors.iter().any(|e| e.starts_with("websocket: ")));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            loader().load_str("[websocket\nport = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("saved.toml");

        let mut config = ServiceConfig::default();
        config.service.name = "saved".to_string();
        config.websocket.port = Some(8081);
        loader().save(&config, &path).unwrap();

        let loaded = loader().load(&path).unwrap();
        assert_eq!(loaded.service.name, "saved");
        assert_eq!(loaded.websocket.port, Some(8081));
    }
}
