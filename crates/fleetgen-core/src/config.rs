//! Runtime configuration: defaults, then `FLEETGEN_*` environment variables.
//!
//! Command-line flags are layered on top by the binary.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::orchestrator::StageTimeouts;

const ENV_PREFIX: &str = "FLEETGEN_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetConfig {
    /// Fleet inventory (TOML)
    pub registry_path: PathBuf,
    /// Generation logs live under `<state_dir>/generations`
    pub state_dir: PathBuf,
    /// Parent of the per-activation secret scopes
    pub secrets_dir: PathBuf,
    pub concurrency: usize,
    pub timeouts: StageTimeouts,
    pub strict_lint: bool,
    /// Argv prefix; the secret locator is appended
    pub decrypt_command: Vec<String>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from("fleet.toml"),
            state_dir: PathBuf::from(".fleetgen"),
            secrets_dir: default_secrets_dir(std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from)),
            concurrency: 4,
            timeouts: StageTimeouts::default(),
            strict_lint: false,
            decrypt_command: vec!["sops".to_string(), "--decrypt".to_string()],
        }
    }
}

/// `$XDG_RUNTIME_DIR/fleetgen` (a tmpfs on most systems), else the temp dir.
pub fn default_secrets_dir(runtime_dir: Option<PathBuf>) -> PathBuf {
    match runtime_dir {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join("fleetgen"),
        _ => std::env::temp_dir().join("fleetgen-secrets"),
    }
}

impl FleetConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup("FLEETGEN_<NAME>")`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key)
                .filter(|v| !v.trim().is_empty())
                .map(|v| (key, v))
        };
        let mut config = Self::default();

        if let Some((_, v)) = get("REGISTRY") {
            config.registry_path = PathBuf::from(v);
        }
        if let Some((_, v)) = get("STATE_DIR") {
            config.state_dir = PathBuf::from(v);
        }
        if let Some((_, v)) = get("SECRETS_DIR") {
            config.secrets_dir = PathBuf::from(v);
        }
        if let Some((key, v)) = get("CONCURRENCY") {
            config.concurrency = match v.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::InvalidValue { key, value: v }),
            };
        }
        if let Some((key, v)) = get("STRICT_LINT") {
            config.strict_lint = parse_bool(&v).ok_or(ConfigError::InvalidValue { key, value: v })?;
        }
        if let Some((key, v)) = get("DECRYPT_COMMAND") {
            let argv: Vec<String> = v.split_whitespace().map(str::to_string).collect();
            if argv.is_empty() {
                return Err(ConfigError::InvalidValue { key, value: v });
            }
            config.decrypt_command = argv;
        }

        let timeouts = &mut config.timeouts;
        for (name, slot) in [
            ("LINT_TIMEOUT_SECS", &mut timeouts.lint),
            ("EVAL_TIMEOUT_SECS", &mut timeouts.eval),
            ("TEST_TIMEOUT_SECS", &mut timeouts.test),
            ("BUILD_TIMEOUT_SECS", &mut timeouts.build),
            ("SECRETS_TIMEOUT_SECS", &mut timeouts.secrets),
            ("PROBE_TIMEOUT_SECS", &mut timeouts.probe),
        ] {
            if let Some((key, v)) = get(name) {
                *slot = parse_secs(&v).ok_or(ConfigError::InvalidValue { key, value: v })?;
            }
        }

        Ok(config)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_secs(raw: &str) -> Option<Duration> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = FleetConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.decrypt_command, vec!["sops", "--decrypt"]);
        assert!(!config.strict_lint);
    }

    #[test]
    fn test_env_overrides() {
        let config = FleetConfig::from_lookup(lookup(&[
            ("FLEETGEN_REGISTRY", "/etc/fleet.toml"),
            ("FLEETGEN_CONCURRENCY", "8"),
            ("FLEETGEN_STRICT_LINT", "yes"),
            ("FLEETGEN_BUILD_TIMEOUT_SECS", "120"),
            ("FLEETGEN_LINT_TIMEOUT_SECS", "15"),
            ("FLEETGEN_DECRYPT_COMMAND", "age --decrypt -i key.txt"),
        ]))
        .unwrap();
        assert_eq!(config.registry_path, PathBuf::from("/etc/fleet.toml"));
        assert_eq!(config.concurrency, 8);
        assert!(config.strict_lint);
        assert_eq!(config.timeouts.build, Duration::from_secs(120));
        assert_eq!(config.timeouts.lint, Duration::from_secs(15));
        assert_eq!(config.timeouts.eval, StageTimeouts::default().eval);
        assert_eq!(config.decrypt_command.len(), 4);
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        for (key, value) in [
            ("FLEETGEN_CONCURRENCY", "0"),
            ("FLEETGEN_CONCURRENCY", "many"),
            ("FLEETGEN_STRICT_LINT", "perhaps"),
            ("FLEETGEN_PROBE_TIMEOUT_SECS", "-1"),
        ] {
            let err = FleetConfig::from_lookup(lookup(&[(key, value)])).unwrap_err();
            assert!(
                matches!(&err, ConfigError::InvalidValue { key: k, .. } if k == key),
                "{key}={value}: {err}"
            );
        }
    }

    #[test]
    fn test_secrets_dir_prefers_runtime_dir() {
        assert_eq!(
            default_secrets_dir(Some(PathBuf::from("/run/user/1000"))),
            PathBuf::from("/run/user/1000/fleetgen")
        );
        assert!(default_secrets_dir(None).ends_with("fleetgen-secrets"));
    }
}
