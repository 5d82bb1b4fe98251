//! Domain errors for fleetgen-core

use std::path::PathBuf;

use generation_store::StoreError;
use thiserror::Error;

/// Problems with the registry or runtime configuration.
///
/// The only error class allowed to fail a run before any host work starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("duplicate host id '{id}'")]
    DuplicateHost { id: String },

    #[error("host '{host}': field '{field}' must not be empty")]
    EmptyField { host: String, field: &'static str },

    #[error("invalid host id '{id}'")]
    InvalidHostId { id: String },

    #[error("host '{host}': unknown platform '{platform}' (expected nixos, darwin or home-manager)")]
    UnknownPlatform { host: String, platform: String },

    #[error("host '{host}': secret '{secret}' has malformed mode '{mode}'")]
    InvalidSecretMode {
        host: String,
        secret: String,
        mode: String,
    },

    #[error("host '{host}': duplicate secret '{secret}'")]
    DuplicateSecret { host: String, secret: String },

    #[error("unknown host '{id}'")]
    UnknownHost { id: String },

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

/// Evaluation of a host configuration failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalError {
    pub message: String,
    pub location: Option<String>,
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} (at {})", self.message, location),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for EvalError {}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
        }
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Building an artifact failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{failed_step}: {message}")]
pub struct BuildError {
    pub message: String,
    pub failed_step: String,
}

impl BuildError {
    pub fn new(message: impl Into<String>, failed_step: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failed_step: failed_step.into(),
        }
    }
}

/// Secret resolution failures. Never carries plaintext.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret '{name}' not found at {locator}")]
    NotFound { name: String, locator: String },

    #[error("secret '{name}' could not be decrypted: {reason}")]
    DecryptionFailed { name: String, reason: String },

    #[error("permission denied writing secret '{name}' to {path}")]
    PermissionDenied { name: String, path: PathBuf },

    #[error("secret scope IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error for operations that are not per-host outcomes.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type FleetResult<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_error_display_includes_location() {
        let err = EvalError::new("undefined variable 'pkgz'").at("hosts/web1.nix:12:5");
        assert_eq!(
            err.to_string(),
            "undefined variable 'pkgz' (at hosts/web1.nix:12:5)"
        );
        assert_eq!(EvalError::new("boom").to_string(), "boom");
    }

    #[test]
    fn test_config_error_names_host() {
        let err = ConfigError::UnknownPlatform {
            host: "web1".into(),
            platform: "windows".into(),
        };
        assert!(err.to_string().contains("web1"));
        assert!(err.to_string().contains("windows"));
    }
}
