//! Host registry: the fleet inventory, loaded from TOML on every invocation.
//!
//! ```toml
//! [[hosts]]
//! id = "web1"
//! platform = "nixos"
//! config = ".#nixosConfigurations.web1"
//! address = "root@web1.internal"
//! health_url = "http://web1.internal:8080/healthz"
//! lint = ["statix", "check", "hosts/web1.nix"]
//!
//! [[hosts.secrets]]
//! name = "db-password"
//! source = "secrets/db.yaml"
//! owner = "postgres"
//! mode = "0400"
//!
//! [[hosts.tests]]
//! name = "ports"
//! command = ["./tests/ports.sh"]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use generation_store::HostId;
use nix_fleet_adapter::Platform;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::secrets::SecretRef;

/// Host-side directory secrets are installed into unless `dest` is given.
pub const DEFAULT_SECRET_DIR: &str = "/run/fleetgen-secrets";

// ---------------------------------------------------------------------------
// Raw file format
// ---------------------------------------------------------------------------

/// Registry file as written by the operator, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    pub id: String,
    pub platform: String,
    pub config: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_reachable")]
    pub reachable: bool,
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default)]
    pub lint: Option<Vec<String>>,
    #[serde(default)]
    pub secrets: Vec<SecretEntry>,
    #[serde(default)]
    pub tests: Vec<TestEntry>,
}

fn default_reachable() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretEntry {
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub owner: Option<String>,
    /// Octal permission string, e.g. `"0400"`
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub dest: Option<PathBuf>,
}

fn default_mode() -> String {
    "0400".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEntry {
    pub name: String,
    pub command: Vec<String>,
}

impl RegistryFile {
    pub fn parse(source: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Check every entry and produce the typed registry.
    pub fn validate(self) -> Result<HostRegistry, ConfigError> {
        let mut seen = HashSet::new();
        let mut hosts = Vec::with_capacity(self.hosts.len());

        for entry in self.hosts {
            if entry.id.trim().is_empty() {
                return Err(ConfigError::EmptyField {
                    host: entry.id,
                    field: "id",
                });
            }
            if !seen.insert(entry.id.clone()) {
                return Err(ConfigError::DuplicateHost { id: entry.id });
            }
            hosts.push(entry.into_host()?);
        }

        Ok(HostRegistry { hosts })
    }
}

impl HostEntry {
    fn into_host(self) -> Result<Host, ConfigError> {
        let id = HostId::new(self.id.clone()).map_err(|_| ConfigError::InvalidHostId {
            id: self.id.clone(),
        })?;

        let platform = parse_platform(&self.platform).ok_or_else(|| ConfigError::UnknownPlatform {
            host: self.id.clone(),
            platform: self.platform.clone(),
        })?;

        if self.config.trim().is_empty() {
            return Err(ConfigError::EmptyField {
                host: self.id,
                field: "config",
            });
        }
        if matches!(&self.lint, Some(cmd) if cmd.is_empty()) {
            return Err(ConfigError::EmptyField {
                host: self.id,
                field: "lint",
            });
        }

        let mut names = HashSet::new();
        let mut secrets = Vec::with_capacity(self.secrets.len());
        for secret in self.secrets {
            if secret.name.trim().is_empty() || secret.name.contains('/') {
                return Err(ConfigError::EmptyField {
                    host: self.id,
                    field: "secrets.name",
                });
            }
            if !names.insert(secret.name.clone()) {
                return Err(ConfigError::DuplicateSecret {
                    host: self.id,
                    secret: secret.name,
                });
            }
            let mode = parse_mode(&secret.mode).ok_or_else(|| ConfigError::InvalidSecretMode {
                host: self.id.clone(),
                secret: secret.name.clone(),
                mode: secret.mode.clone(),
            })?;
            let dest = secret
                .dest
                .unwrap_or_else(|| Path::new(DEFAULT_SECRET_DIR).join(&secret.name));
            secrets.push(SecretRef {
                name: secret.name,
                source: secret.source,
                host: id.clone(),
                owner: secret.owner,
                mode,
                dest,
            });
        }

        for test in &self.tests {
            if test.command.is_empty() {
                return Err(ConfigError::EmptyField {
                    host: self.id,
                    field: "tests.command",
                });
            }
        }

        Ok(Host {
            id,
            platform,
            config_ref: self.config,
            address: self.address,
            reachable: self.reachable,
            health_url: self.health_url,
            lint: self.lint,
            secrets,
            tests: self.tests,
        })
    }
}

fn parse_platform(raw: &str) -> Option<Platform> {
    match raw {
        "nixos" => Some(Platform::NixOs),
        "darwin" => Some(Platform::Darwin),
        "home-manager" => Some(Platform::HomeManager),
        _ => None,
    }
}

/// Parse an octal mode such as `"0400"` or `"600"`. Only permission bits are accepted.
pub fn parse_mode(raw: &str) -> Option<u32> {
    let digits = raw.strip_prefix("0o").unwrap_or(raw);
    if digits.is_empty() || digits.len() > 4 {
        return None;
    }
    u32::from_str_radix(digits, 8).ok().filter(|m| *m <= 0o777)
}

// ---------------------------------------------------------------------------
// Validated registry
// ---------------------------------------------------------------------------

/// A validated fleet member. Immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct Host {
    pub id: HostId,
    pub platform: Platform,
    /// Opaque reference understood by the evaluator
    pub config_ref: String,
    pub address: Option<String>,
    pub reachable: bool,
    pub health_url: Option<String>,
    pub lint: Option<Vec<String>>,
    pub secrets: Vec<SecretRef>,
    pub tests: Vec<TestEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    hosts: Vec<Host>,
}

impl HostRegistry {
    /// Read, parse and validate a registry file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        RegistryFile::parse(&source, path)?.validate()
    }

    /// Hosts in file order.
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn get(&self, id: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.id.as_str() == id)
    }

    /// The named hosts in the order given; an empty selection is the whole fleet.
    pub fn select(&self, ids: &[String]) -> Result<Vec<Host>, ConfigError> {
        if ids.is_empty() {
            return Ok(self.hosts.clone());
        }
        let mut picked = Vec::with_capacity(ids.len());
        let mut seen = HashSet::new();
        for id in ids {
            let host = self
                .get(id)
                .ok_or_else(|| ConfigError::UnknownHost { id: id.clone() })?;
            if seen.insert(id.as_str()) {
                picked.push(host.clone());
            }
        }
        Ok(picked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLEET: &str = r#"
[[hosts]]
id = "web1"
platform = "nixos"
config = ".#nixosConfigurations.web1"
address = "root@web1"
health_url = "http://web1:8080/healthz"

[[hosts.secrets]]
name = "db-password"
source = "secrets/db.yaml"
owner = "postgres"
mode = "0440"

[[hosts.tests]]
name = "smoke"
command = ["true"]

[[hosts]]
id = "mac"
platform = "darwin"
config = ".#darwinConfigurations.mac"
reachable = false
"#;

    fn parse(source: &str) -> Result<HostRegistry, ConfigError> {
        RegistryFile::parse(source, Path::new("fleet.toml"))?.validate()
    }

    #[test]
    fn test_load_preserves_file_order_and_defaults() {
        let registry = parse(FLEET).unwrap();
        let ids: Vec<&str> = registry.hosts().iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["web1", "mac"]);

        let web = registry.get("web1").unwrap();
        assert_eq!(web.platform, Platform::NixOs);
        assert!(web.reachable);
        assert_eq!(web.secrets[0].mode, 0o440);
        assert_eq!(
            web.secrets[0].dest,
            PathBuf::from("/run/fleetgen-secrets/db-password")
        );
        assert_eq!(web.tests.len(), 1);

        let mac = registry.get("mac").unwrap();
        assert!(!mac.reachable);
        assert!(mac.secrets.is_empty());
    }

    #[test]
    fn test_duplicate_host_rejected() {
        let source = r#"
[[hosts]]
id = "a"
platform = "nixos"
config = ".#a"
[[hosts]]
id = "a"
platform = "nixos"
config = ".#a"
"#;
        assert!(matches!(
            parse(source),
            Err(ConfigError::DuplicateHost { id }) if id == "a"
        ));
    }

    #[test]
    fn test_unknown_platform_rejected() {
        let source = r#"
[[hosts]]
id = "box"
platform = "windows"
config = ".#box"
"#;
        assert!(matches!(
            parse(source),
            Err(ConfigError::UnknownPlatform { .. })
        ));
    }

    #[test]
    fn test_malformed_mode_rejected() {
        let source = r#"
[[hosts]]
id = "box"
platform = "nixos"
config = ".#box"
[[hosts.secrets]]
name = "k"
source = "k.age"
mode = "rw-r--r--"
"#;
        assert!(matches!(
            parse(source),
            Err(ConfigError::InvalidSecretMode { .. })
        ));
    }

    #[test]
    fn test_empty_config_rejected() {
        let source = r#"
[[hosts]]
id = "box"
platform = "home-manager"
config = ""
"#;
        assert!(matches!(
            parse(source),
            Err(ConfigError::EmptyField { field: "config", .. })
        ));
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("0400"), Some(0o400));
        assert_eq!(parse_mode("600"), Some(0o600));
        assert_eq!(parse_mode("0o644"), Some(0o644));
        assert_eq!(parse_mode("4777"), None);
        assert_eq!(parse_mode("0800"), None);
        assert_eq!(parse_mode(""), None);
    }

    #[test]
    fn test_select_in_requested_order() {
        let registry = parse(FLEET).unwrap();
        let picked = registry
            .select(&["mac".to_string(), "web1".to_string(), "mac".to_string()])
            .unwrap();
        let ids: Vec<&str> = picked.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["mac", "web1"]);

        assert_eq!(registry.select(&[]).unwrap().len(), 2);
        assert!(matches!(
            registry.select(&["nope".to_string()]),
            Err(ConfigError::UnknownHost { .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = HostRegistry::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
