//! Test doubles for the evaluator, builder, secret backend and probe,
//! plus a [`Harness`] wiring them into an [`Orchestrator`].

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use generation_store::fakes::{FakeActivator, MemoryGenerationLog};
use generation_store::{Artifact, ContentHash, GenerationStore, HostId};
use tempfile::TempDir;
use zeroize::Zeroizing;

use crate::adapters::{Builder, EvaluatedGraph, Evaluator};
use crate::check::CheckPipeline;
use crate::error::{BuildError, EvalError, SecretError};
use crate::orchestrator::Orchestrator;
use crate::probe::HealthProbe;
use crate::registry::Host;
use crate::secrets::{SecretBackend, SecretRef, SecretResolver};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct EvaluatorState {
    failing: HashMap<HostId, String>,
    delays: HashMap<HostId, Duration>,
    calls: Vec<HostId>,
}

/// Evaluates every host successfully unless told otherwise.
#[derive(Debug, Default)]
pub struct FakeEvaluator {
    state: Mutex<EvaluatorState>,
}

impl FakeEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, host: &str, message: &str) {
        if let Ok(id) = HostId::new(host) {
            lock(&self.state).failing.insert(id, message.to_string());
        }
    }

    pub fn delay(&self, host: &str, delay: Duration) {
        if let Ok(id) = HostId::new(host) {
            lock(&self.state).delays.insert(id, delay);
        }
    }

    pub fn calls(&self) -> Vec<HostId> {
        lock(&self.state).calls.clone()
    }
}

#[async_trait]
impl Evaluator for FakeEvaluator {
    async fn evaluate(&self, host: &Host) -> Result<EvaluatedGraph, EvalError> {
        let (failure, delay) = {
            let mut state = lock(&self.state);
            state.calls.push(host.id.clone());
            (
                state.failing.get(&host.id).cloned(),
                state.delays.get(&host.id).copied(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = failure {
            return Err(EvalError::new(message).at(format!("hosts/{}.nix:1:1", host.id)));
        }
        Ok(EvaluatedGraph {
            host: host.id.clone(),
            installable: format!("{}.toplevel", host.config_ref),
            derivation: format!("/nix/store/fake-{}.drv", host.id),
        })
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BuilderState {
    versions: HashMap<HostId, String>,
    failing: HashMap<HostId, BuildError>,
    delays: HashMap<HostId, Duration>,
    builds: Vec<HostId>,
}

/// Deterministic builder: the artifact depends only on host and version.
#[derive(Debug, Default)]
pub struct FakeBuilder {
    state: Mutex<BuilderState>,
}

impl FakeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Change what the next build of `host` produces.
    pub fn set_version(&self, host: &str, version: &str) {
        if let Ok(id) = HostId::new(host) {
            lock(&self.state).versions.insert(id, version.to_string());
        }
    }

    pub fn fail(&self, host: &str, message: &str, failed_step: &str) {
        if let Ok(id) = HostId::new(host) {
            lock(&self.state)
                .failing
                .insert(id, BuildError::new(message, failed_step));
        }
    }

    pub fn delay(&self, host: &str, delay: Duration) {
        if let Ok(id) = HostId::new(host) {
            lock(&self.state).delays.insert(id, delay);
        }
    }

    pub fn builds(&self, host: &HostId) -> usize {
        lock(&self.state).builds.iter().filter(|h| *h == host).count()
    }

    /// The artifact a build of `host` at `version` yields.
    pub fn artifact_for(host: &HostId, version: &str) -> Artifact {
        let name = format!("{host}-{version}");
        Artifact {
            content_hash: ContentHash::from_bytes(name.as_bytes()),
            path: PathBuf::from(format!("/nix/store/{name}-system")),
        }
    }
}

#[async_trait]
impl Builder for FakeBuilder {
    async fn build(&self, graph: &EvaluatedGraph) -> Result<Artifact, BuildError> {
        let (failure, delay, version) = {
            let mut state = lock(&self.state);
            state.builds.push(graph.host.clone());
            (
                state.failing.get(&graph.host).cloned(),
                state.delays.get(&graph.host).copied(),
                state
                    .versions
                    .get(&graph.host)
                    .cloned()
                    .unwrap_or_else(|| "v1".to_string()),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(Self::artifact_for(&graph.host, &version)),
        }
    }
}

// ---------------------------------------------------------------------------
// Secret backend
// ---------------------------------------------------------------------------

/// Backend serving plaintext from memory, keyed by source locator.
#[derive(Debug, Default)]
pub struct MemorySecretBackend {
    secrets: Mutex<HashMap<String, Vec<u8>>>,
    undecryptable: Mutex<HashSet<String>>,
}

impl MemorySecretBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, source: &str, plaintext: &[u8]) {
        lock(&self.secrets).insert(source.to_string(), plaintext.to_vec());
    }

    pub fn corrupt(&self, source: &str) {
        lock(&self.undecryptable).insert(source.to_string());
    }
}

#[async_trait]
impl SecretBackend for MemorySecretBackend {
    async fn decrypt(&self, secret: &SecretRef) -> Result<Zeroizing<Vec<u8>>, SecretError> {
        if lock(&self.undecryptable).contains(&secret.source) {
            return Err(SecretError::DecryptionFailed {
                name: secret.name.clone(),
                reason: "no matching key".to_string(),
            });
        }
        lock(&self.secrets)
            .get(&secret.source)
            .map(|p| Zeroizing::new(p.clone()))
            .ok_or_else(|| SecretError::NotFound {
                name: secret.name.clone(),
                locator: secret.source.clone(),
            })
    }
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FakeProbe {
    unhealthy: Mutex<HashSet<HostId>>,
    probed: Mutex<Vec<HostId>>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_unhealthy(&self, host: &str) {
        if let Ok(id) = HostId::new(host) {
            lock(&self.unhealthy).insert(id);
        }
    }

    pub fn probed(&self) -> Vec<HostId> {
        lock(&self.probed).clone()
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn probe(&self, host: &HostId, url: &str) -> anyhow::Result<()> {
        lock(&self.probed).push(host.clone());
        if lock(&self.unhealthy).contains(host) {
            anyhow::bail!("{url} returned 503 Service Unavailable");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// An orchestrator over in-memory fakes, with handles to each fake.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub evaluator: Arc<FakeEvaluator>,
    pub builder: Arc<FakeBuilder>,
    pub activator: Arc<FakeActivator>,
    pub backend: Arc<MemorySecretBackend>,
    pub probe: Arc<FakeProbe>,
    pub log: Arc<MemoryGenerationLog>,
    secrets_dir: TempDir,
}

impl Harness {
    pub fn new() -> std::io::Result<Self> {
        let evaluator = Arc::new(FakeEvaluator::new());
        let builder = Arc::new(FakeBuilder::new());
        let activator = Arc::new(FakeActivator::new());
        let backend = Arc::new(MemorySecretBackend::new());
        let probe = Arc::new(FakeProbe::new());
        let log = Arc::new(MemoryGenerationLog::new());
        let secrets_dir = tempfile::tempdir()?;

        let store = Arc::new(GenerationStore::new(log.clone(), activator.clone()));
        let orchestrator = Orchestrator::new(
            store,
            CheckPipeline::new(evaluator.clone()),
            builder.clone(),
            SecretResolver::new(backend.clone()),
            probe.clone(),
            secrets_dir.path(),
        );

        Ok(Self {
            orchestrator,
            evaluator,
            builder,
            activator,
            backend,
            probe,
            log,
            secrets_dir,
        })
    }

    /// Parent directory of every secret scope this harness opens.
    pub fn secrets_dir(&self) -> &std::path::Path {
        self.secrets_dir.path()
    }
}

/// A reachable NixOS host with no secrets, tests or probe.
pub fn host(id: &str) -> Host {
    let host_id = HostId::new(id).unwrap_or_else(|_| panic!("invalid fake host id {id}"));
    Host {
        id: host_id,
        platform: nix_fleet_adapter::Platform::NixOs,
        config_ref: format!(".#nixosConfigurations.{id}"),
        address: None,
        reachable: true,
        health_url: None,
        lint: None,
        secrets: vec![],
        tests: vec![],
    }
}
