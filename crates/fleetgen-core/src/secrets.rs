//! Secret resolution into a scoped, ephemeral directory.
//!
//! A [`SecretScope`] owns a private 0700 directory under the runtime
//! secrets dir. Plaintext lives there only for one activation: files are
//! overwritten with zeros and unlinked on [`SecretScope::close`], and again
//! from `Drop` if the scope is abandoned by an error, a panic or a cancelled
//! task. Secret contents are never logged.

use std::fs::{self, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use generation_store::{HostId, SecretMount};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::SecretError;

/// A declared secret: where the ciphertext is and how the host should see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    /// Encrypted source locator, interpreted by the backend
    pub source: String,
    pub host: HostId,
    pub owner: Option<String>,
    pub mode: u32,
    /// Install path on the host
    pub dest: PathBuf,
}

/// A secret decrypted into the current scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSecret {
    pub name: String,
    pub path: PathBuf,
    pub owner: Option<String>,
    pub mode: u32,
}

impl ResolvedSecret {
    pub fn mount(&self) -> SecretMount {
        SecretMount {
            name: self.name.clone(),
            path: self.path.clone(),
            owner: self.owner.clone(),
            mode: self.mode,
        }
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Private directory holding plaintext for exactly one activation.
#[derive(Debug)]
pub struct SecretScope {
    host: HostId,
    root: PathBuf,
    files: Vec<PathBuf>,
    closed: bool,
    dir: Option<TempDir>,
}

impl SecretScope {
    /// Create a fresh scope directory below `base`.
    pub fn open(base: &Path, host: &HostId) -> Result<Self, SecretError> {
        fs::create_dir_all(base)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("fleetgen-{host}-"))
            .tempdir_in(base)?;
        fs::set_permissions(dir.path(), Permissions::from_mode(0o700))?;
        debug!(host = %host, "secret scope opened");
        Ok(Self {
            host: host.clone(),
            root: dir.path().to_path_buf(),
            files: Vec::new(),
            closed: false,
            dir: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn host(&self) -> &HostId {
        &self.host
    }

    /// Write `plaintext` as `name` with permission `mode`.
    pub fn write(&mut self, name: &str, plaintext: &[u8], mode: u32) -> Result<PathBuf, SecretError> {
        let path = self.root.join(name);
        let denied = |e: std::io::Error| match e.kind() {
            std::io::ErrorKind::PermissionDenied => SecretError::PermissionDenied {
                name: name.to_string(),
                path: path.clone(),
            },
            _ => SecretError::Io(e),
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(denied)?;
        self.files.push(path.clone());
        file.write_all(plaintext).map_err(denied)?;
        file.sync_all().map_err(denied)?;
        fs::set_permissions(&path, Permissions::from_mode(mode)).map_err(denied)?;
        Ok(path)
    }

    /// Overwrite and remove every file, then the directory.
    pub fn close(mut self) -> Result<(), SecretError> {
        self.shred();
        self.closed = true;
        if let Some(dir) = self.dir.take() {
            dir.close()?;
        }
        Ok(())
    }

    fn shred(&mut self) {
        for path in self.files.drain(..) {
            if let Err(e) = shred_file(&path) {
                warn!(host = %self.host, path = %path.display(), error = %e, "failed to shred secret file");
            }
        }
        debug!(host = %self.host, "secret scope shredded");
    }
}

impl Drop for SecretScope {
    fn drop(&mut self) {
        if !self.closed {
            self.shred();
        }
    }
}

fn shred_file(path: &Path) -> std::io::Result<()> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    fs::set_permissions(path, Permissions::from_mode(0o600))?;
    let mut file = OpenOptions::new().write(true).open(path)?;
    let zeros = vec![0u8; 4096];
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(zeros.len() as u64) as usize;
        file.write_all(&zeros[..chunk])?;
        remaining -= chunk as u64;
    }
    file.sync_all()?;
    drop(file);
    fs::remove_file(path)
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Turns an encrypted locator into plaintext bytes.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    async fn decrypt(&self, secret: &SecretRef) -> Result<Zeroizing<Vec<u8>>, SecretError>;
}

/// Backend that runs an external decrypt command with the locator appended,
/// e.g. `sops --decrypt secrets/db.yaml`. Plaintext is read from stdout.
#[derive(Debug, Clone)]
pub struct CommandSecretBackend {
    program: String,
    args: Vec<String>,
    base_dir: Option<PathBuf>,
}

impl CommandSecretBackend {
    /// `command` is the full argv prefix; the first element is the program.
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            base_dir: None,
        })
    }

    /// Resolve relative locators against `dir` (usually the registry's directory).
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    fn locate(&self, source: &str) -> String {
        if source.contains("://") {
            return source.to_string();
        }
        match &self.base_dir {
            Some(base) if Path::new(source).is_relative() => {
                base.join(source).display().to_string()
            }
            _ => source.to_string(),
        }
    }
}

#[async_trait]
impl SecretBackend for CommandSecretBackend {
    async fn decrypt(&self, secret: &SecretRef) -> Result<Zeroizing<Vec<u8>>, SecretError> {
        let locator = self.locate(&secret.source);
        if !locator.contains("://") && !Path::new(&locator).exists() {
            return Err(SecretError::NotFound {
                name: secret.name.clone(),
                locator,
            });
        }

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&locator)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SecretError::DecryptionFailed {
                name: secret.name.clone(),
                reason: format!("cannot run {}: {e}", self.program),
            })?;

        let plaintext = Zeroizing::new(output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("decrypt command failed")
                .to_string();
            return Err(SecretError::DecryptionFailed {
                name: secret.name.clone(),
                reason,
            });
        }
        Ok(plaintext)
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SecretResolver {
    backend: Arc<dyn SecretBackend>,
}

impl SecretResolver {
    pub fn new(backend: Arc<dyn SecretBackend>) -> Self {
        Self { backend }
    }

    /// Decrypt every ref into `scope`. On error the scope still owns whatever
    /// was written and cleans it up when dropped.
    pub async fn resolve(
        &self,
        refs: &[SecretRef],
        scope: &mut SecretScope,
    ) -> Result<Vec<ResolvedSecret>, SecretError> {
        let mut resolved = Vec::with_capacity(refs.len());
        for secret in refs {
            let plaintext = match self.backend.decrypt(secret).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(host = %secret.host, secret = %secret.name, error = %e, "secret resolution failed");
                    return Err(e);
                }
            };
            let path = scope.write(&secret.name, &plaintext, secret.mode)?;
            info!(host = %secret.host, secret = %secret.name, "secret resolved");
            resolved.push(ResolvedSecret {
                name: secret.name.clone(),
                path,
                owner: secret.owner.clone(),
                mode: secret.mode,
            });
        }
        Ok(resolved)
    }
}
