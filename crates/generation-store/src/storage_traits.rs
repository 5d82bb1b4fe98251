//! Storage and activation trait definitions
//!
//! - `GenerationLog`: append-only persistence of `LogRecord`s, one log per host
//! - `Activator`: the host-side switch that makes an artifact live
//!
//! Both are async and backend-agnostic. In-memory fakes live in `fakes`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::schema::{Artifact, HostId, LogRecord};
use crate::StoreResult;

/// Append-only generation log.
///
/// Guarantees:
/// - `load` returns every record previously appended for the host, in order.
/// - `append` is durable once it returns `Ok`; records are never rewritten.
#[async_trait]
pub trait GenerationLog: Send + Sync {
    /// Read all records for a host (empty if the host has no history).
    async fn load(&self, host: &HostId) -> StoreResult<Vec<LogRecord>>;

    /// Durably append records for a host, in order.
    async fn append(&self, host: &HostId, records: &[LogRecord]) -> StoreResult<()>;

    /// Hosts that have at least one record.
    async fn hosts(&self) -> StoreResult<Vec<HostId>>;
}

/// A decrypted secret made available to an activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMount {
    /// Logical secret name
    pub name: String,
    /// Ephemeral plaintext location, valid for the activation scope only
    pub path: PathBuf,
    /// Owner the file must have on the target
    pub owner: Option<String>,
    /// Permission bits the file must have on the target
    pub mode: u32,
}

/// Inputs handed to the activator alongside the artifact.
#[derive(Debug, Clone, Default)]
pub struct ActivationContext {
    pub secrets: Vec<SecretMount>,
}

impl ActivationContext {
    pub fn with_secrets(secrets: Vec<SecretMount>) -> Self {
        Self { secrets }
    }
}

/// Host-side switch boundary.
///
/// Contract: `switch` is all-or-nothing. On `Err` the host must still be
/// running whatever it ran before the call.
#[async_trait]
pub trait Activator: Send + Sync {
    /// Make `artifact` the live configuration of `host`.
    async fn switch(
        &self,
        host: &HostId,
        artifact: &Artifact,
        context: &ActivationContext,
    ) -> anyhow::Result<()>;

    /// Whether the artifact is still present and can be re-activated.
    async fn artifact_exists(&self, host: &HostId, artifact: &Artifact) -> anyhow::Result<bool>;
}
