//! Evaluation and realisation of host configurations
//!
//! A host's configuration reference (for example `.#nixosConfigurations.web1`)
//! is resolved to a derivation with `nix eval`, then realised with
//! `nix build`. The resulting store path is the artifact; its content hash is
//! the SHA-256 of the path, which Nix already derives from every input.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::command::NixCli;
use crate::error::NixError;
use crate::Result;

/// Kind of system a configuration targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    #[serde(rename = "nixos")]
    NixOs,
    Darwin,
    HomeManager,
}

impl Platform {
    /// Attribute under the configuration that yields the system closure.
    pub fn toplevel_attr(&self) -> &'static str {
        match self {
            Platform::NixOs => "config.system.build.toplevel",
            Platform::Darwin => "system",
            Platform::HomeManager => "activationPackage",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::NixOs => "nixos",
            Platform::Darwin => "darwin",
            Platform::HomeManager => "home-manager",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configuration resolved to its derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatedDrv {
    /// Installable that was evaluated, e.g. `.#nixosConfigurations.web1.config.system.build.toplevel`
    pub installable: String,
    /// `/nix/store/<hash>-<name>.drv`
    pub drv_path: String,
}

/// A realised store path and its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltPath {
    pub out_path: PathBuf,
    /// SHA-256 hex of the out path
    pub content_hash: String,
}

/// Content hash for a store path.
pub fn content_hash_of(out_path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(out_path.to_string_lossy().as_bytes());
    hex::encode(hasher.finalize())
}

/// Installable for a configuration reference on a platform.
pub fn installable_for(config_ref: &str, platform: Platform) -> String {
    format!(
        "{}.{}",
        config_ref.trim_end_matches('.'),
        platform.toplevel_attr()
    )
}

impl NixCli {
    /// Resolve `config_ref` to a derivation without building anything.
    pub async fn evaluate(&self, config_ref: &str, platform: Platform) -> Result<EvaluatedDrv> {
        let installable = installable_for(config_ref, platform);
        debug!(%installable, "evaluating");

        let args = vec![
            "eval".to_string(),
            "--raw".to_string(),
            format!("{installable}.drvPath"),
        ];
        let out = self.run(&args).await.map_err(eval_error)?;
        let drv_path = out
            .last_line()
            .filter(|l| l.ends_with(".drv"))
            .ok_or_else(|| NixError::UnexpectedOutput(out.stdout.clone()))?
            .to_string();

        Ok(EvaluatedDrv {
            installable,
            drv_path,
        })
    }

    /// Realise a derivation into a store path.
    pub async fn build(&self, drv: &EvaluatedDrv) -> Result<BuiltPath> {
        let args = vec![
            "build".to_string(),
            "--no-link".to_string(),
            "--print-out-paths".to_string(),
            format!("{}^*", drv.drv_path),
        ];
        let out = self
            .run(&args)
            .await
            .map_err(|e| build_error(e, &drv.drv_path))?;
        let out_path = out
            .last_line()
            .filter(|l| l.starts_with('/'))
            .map(PathBuf::from)
            .ok_or_else(|| NixError::UnexpectedOutput(out.stdout.clone()))?;

        let content_hash = content_hash_of(&out_path);
        info!(path = %out_path.display(), hash = &content_hash[..12], "realised");
        Ok(BuiltPath {
            out_path,
            content_hash,
        })
    }

    /// Whether `path` is valid in the local store.
    pub async fn path_exists(&self, path: &Path) -> Result<bool> {
        let args = vec!["path-info".to_string(), path.display().to_string()];
        match self.run(&args).await {
            Ok(_) => Ok(true),
            Err(NixError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn eval_error(err: NixError) -> NixError {
    match err {
        NixError::CommandFailed { stderr, .. } => {
            let (message, location) = parse_eval_stderr(&stderr);
            NixError::EvalFailed { message, location }
        }
        other => other,
    }
}

fn build_error(err: NixError, drv_path: &str) -> NixError {
    match err {
        NixError::CommandFailed { stderr, .. } => {
            let failed_step = parse_failed_step(&stderr).unwrap_or_else(|| drv_path.to_string());
            NixError::BuildFailed {
                message: first_error_line(&stderr),
                failed_step,
            }
        }
        other => other,
    }
}

fn first_error_line(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix("error:"))
        .map(|l| l.trim().to_string())
        .unwrap_or_else(|| stderr.trim().to_string())
}

/// Split Nix evaluation stderr into the error message and `file:line:col`.
pub fn parse_eval_stderr(stderr: &str) -> (String, Option<String>) {
    let location = stderr
        .lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix("at "))
        .map(|l| l.trim_end_matches(':').to_string());
    (first_error_line(stderr), location)
}

/// Derivation named in a `builder for '...' failed` message.
pub fn parse_failed_step(stderr: &str) -> Option<String> {
    for marker in ["builder for '", "Cannot build '"] {
        if let Some(start) = stderr.find(marker) {
            let rest = &stderr[start + marker.len()..];
            if let Some(end) = rest.find('\'') {
                return Some(rest[..end].to_string());
            }
        }
    }
    None
}
