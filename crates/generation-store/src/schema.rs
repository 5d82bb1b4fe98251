//! Schema definitions for generation history
//!
//! `LogRecord` is the persisted line format; `Generation` is the folded view
//! of every record sharing a sequence number.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::error::StoreError;

/// Host identifier.
///
/// Restricted to `[A-Za-z0-9._-]` (not starting with `.`) because it names
/// the host's log file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostId(String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Result<Self, StoreError> {
        let id = id.into();
        let valid = !id.is_empty()
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(StoreError::InvalidHostId { id });
        }
        Ok(HostId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for HostId {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        HostId::new(s)
    }
}

impl From<HostId> for String {
    fn from(id: HostId) -> Self {
        id.0
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Artifact content hash (SHA-256 hex string).
///
/// The inner field is private so the value is always 64 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentHash(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentHash {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StoreError::InvalidHash { hash: s });
        }
        Ok(ContentHash(s.to_ascii_lowercase()))
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A built, content-addressed configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub content_hash: ContentHash,
    /// Opaque store path produced by the builder
    pub path: PathBuf,
}

/// Lifecycle status of a generation.
///
/// `pending → active → superseded → rolled-back`, with `active → rolled-back`
/// directly and `pending → discarded` for attempts that never went live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GenerationStatus {
    Pending,
    Active,
    Superseded,
    RolledBack,
    Discarded,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Pending => "pending",
            GenerationStatus::Active => "active",
            GenerationStatus::Superseded => "superseded",
            GenerationStatus::RolledBack => "rolled-back",
            GenerationStatus::Discarded => "discarded",
        }
    }

    /// Whether the state machine allows `self → next`.
    pub fn can_transition_to(&self, next: GenerationStatus) -> bool {
        use GenerationStatus::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Discarded)
                | (Active, Superseded)
                | (Active, RolledBack)
                | (Superseded, RolledBack)
        )
    }

    /// Whether a generation in this status has been live at some point.
    pub fn was_activated(&self) -> bool {
        matches!(
            self,
            GenerationStatus::Active | GenerationStatus::Superseded | GenerationStatus::RolledBack
        )
    }
}

impl std::fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of a host's append-only generation log.
///
/// The first line for a sequence creates the generation; later lines for the
/// same sequence carry status changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub sequence: u64,
    pub content_hash: ContentHash,
    pub artifact_path: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub status: GenerationStatus,
    pub predecessor: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_from: Option<u64>,
}

impl LogRecord {
    /// Status-change line for an existing generation.
    pub fn transition(generation: &Generation, status: GenerationStatus) -> Self {
        LogRecord {
            sequence: generation.sequence,
            content_hash: generation.content_hash.clone(),
            artifact_path: generation.artifact_path.clone(),
            timestamp: Utc::now(),
            status,
            predecessor: generation.predecessor,
            restored_from: generation.restored_from,
        }
    }
}

/// Folded view of one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub host: HostId,
    pub sequence: u64,
    pub content_hash: ContentHash,
    pub artifact_path: PathBuf,
    pub recorded_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub status: GenerationStatus,
    pub predecessor: Option<u64>,
    /// Set on generations created by a rollback: the generation whose
    /// artifact was re-activated.
    pub restored_from: Option<u64>,
}

impl Generation {
    pub fn artifact(&self) -> Artifact {
        Artifact {
            content_hash: self.content_hash.clone(),
            path: self.artifact_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_id_rejects_path_characters() {
        assert!(HostId::new("web-1.prod").is_ok());
        assert!(HostId::new("").is_err());
        assert!(HostId::new("../etc").is_err());
        assert!(HostId::new("a/b").is_err());
        assert!(HostId::new(".hidden").is_err());
    }

    #[test]
    fn test_content_hash_from_bytes_is_64_hex() {
        let hash = ContentHash::from_bytes(b"/nix/store/abc-system");
        assert_eq!(hash.as_str().len(), 64);
        assert_eq!(hash.short().len(), 12);
    }

    #[test]
    fn test_content_hash_try_from_normalizes_case() {
        let upper = "A".repeat(64);
        let hash = ContentHash::try_from(upper).expect("valid hex");
        assert_eq!(hash.as_str(), "a".repeat(64));
        assert!(ContentHash::try_from("xyz".to_string()).is_err());
    }

    #[test]
    fn test_state_machine_edges() {
        use GenerationStatus::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Pending.can_transition_to(Discarded));
        assert!(Active.can_transition_to(Superseded));
        assert!(Superseded.can_transition_to(RolledBack));
        assert!(!Superseded.can_transition_to(Active));
        assert!(!RolledBack.can_transition_to(Active));
        assert!(!Active.can_transition_to(Pending));
        assert!(!Discarded.can_transition_to(Active));
    }

    #[test]
    fn test_status_serializes_kebab_case() {
        let json = serde_json::to_string(&GenerationStatus::RolledBack).expect("serialize");
        assert_eq!(json, "\"rolled-back\"");
    }
}
