//! In-memory fakes for the log and activator (testing only)
//!
//! `MemoryGenerationLog` and `FakeActivator` satisfy the trait contracts
//! without touching disk or any host.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::schema::{Artifact, ContentHash, HostId, LogRecord};
use crate::storage_traits::{ActivationContext, Activator, GenerationLog};
use crate::StoreResult;

// ---------------------------------------------------------------------------
// MemoryGenerationLog
// ---------------------------------------------------------------------------

/// In-memory log backed by a `HashMap<host, Vec<LogRecord>>`.
#[derive(Debug, Default)]
pub struct MemoryGenerationLog {
    logs: Mutex<HashMap<HostId, Vec<LogRecord>>>,
    failing_appends: Mutex<usize>,
}

impl MemoryGenerationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the raw records for a host.
    pub fn records(&self, host: &HostId) -> Vec<LogRecord> {
        let logs = self.logs.lock().unwrap();
        logs.get(host).cloned().unwrap_or_default()
    }

    /// Make the next `count` appends fail without writing anything.
    pub fn fail_next_appends(&self, count: usize) {
        *self.failing_appends.lock().unwrap() = count;
    }
}

#[async_trait]
impl GenerationLog for MemoryGenerationLog {
    async fn load(&self, host: &HostId) -> StoreResult<Vec<LogRecord>> {
        Ok(self.records(host))
    }

    async fn append(&self, host: &HostId, records: &[LogRecord]) -> StoreResult<()> {
        {
            let mut failing = self.failing_appends.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(std::io::Error::other("injected append failure").into());
            }
        }
        let mut logs = self.logs.lock().unwrap();
        logs.entry(host.clone())
            .or_default()
            .extend(records.iter().cloned());
        Ok(())
    }

    async fn hosts(&self) -> StoreResult<Vec<HostId>> {
        let logs = self.logs.lock().unwrap();
        let mut hosts: Vec<HostId> = logs.keys().cloned().collect();
        hosts.sort();
        Ok(hosts)
    }
}

// ---------------------------------------------------------------------------
// FakeActivator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ActivatorState {
    live: HashMap<HostId, ContentHash>,
    failing: HashSet<HostId>,
    missing: HashSet<ContentHash>,
    switches: Vec<(HostId, ContentHash)>,
    secrets_seen: Vec<(HostId, String, bool)>,
}

/// Activator that tracks which artifact each host is "running".
///
/// Every artifact is considered present unless removed with
/// `remove_artifact`. Switches for hosts marked failing return an error
/// and leave the live artifact unchanged.
#[derive(Debug, Default)]
pub struct FakeActivator {
    state: Mutex<ActivatorState>,
}

impl FakeActivator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_switches_for(&self, host: &HostId) {
        self.state.lock().unwrap().failing.insert(host.clone());
    }

    pub fn allow_switches_for(&self, host: &HostId) {
        self.state.lock().unwrap().failing.remove(host);
    }

    pub fn remove_artifact(&self, artifact: &Artifact) {
        self.state
            .lock()
            .unwrap()
            .missing
            .insert(artifact.content_hash.clone());
    }

    /// Hash of the artifact currently live on `host`.
    pub fn live(&self, host: &HostId) -> Option<ContentHash> {
        self.state.lock().unwrap().live.get(host).cloned()
    }

    /// Number of successful switches performed on `host`.
    pub fn switch_count(&self, host: &HostId) -> usize {
        self.state
            .lock()
            .unwrap()
            .switches
            .iter()
            .filter(|(h, _)| h == host)
            .count()
    }

    /// `(host, secret name, file existed during switch)` for every secret
    /// handed to a switch.
    pub fn secrets_seen(&self) -> Vec<(HostId, String, bool)> {
        self.state.lock().unwrap().secrets_seen.clone()
    }
}

#[async_trait]
impl Activator for FakeActivator {
    async fn switch(
        &self,
        host: &HostId,
        artifact: &Artifact,
        context: &ActivationContext,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        for secret in &context.secrets {
            let present = secret.path.exists();
            state
                .secrets_seen
                .push((host.clone(), secret.name.clone(), present));
        }
        if state.failing.contains(host) {
            anyhow::bail!("switch-to-configuration failed on {}", host);
        }
        state.live.insert(host.clone(), artifact.content_hash.clone());
        state
            .switches
            .push((host.clone(), artifact.content_hash.clone()));
        Ok(())
    }

    async fn artifact_exists(&self, _host: &HostId, artifact: &Artifact) -> anyhow::Result<bool> {
        Ok(!self
            .state
            .lock()
            .unwrap()
            .missing
            .contains(&artifact.content_hash))
    }
}
