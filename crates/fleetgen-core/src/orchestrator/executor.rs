//! Per-host deployment workers under a shared semaphore.
//!
//! One task drives one host through check → build → secrets → activate →
//! probe. Permits are acquired in plan order before a worker is spawned.
//! The abort flag travels on a `watch` channel: a worker that fails under
//! abort-on-first-failure raises it before releasing its permit, so every
//! host that has not yet acquired a permit is skipped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use generation_store::{
    ActivationContext, Artifact, Generation, GenerationStore, HostId, RollbackError,
};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::adapters::Builder;
use crate::check::{CheckOptions, CheckPipeline, CheckReport, CheckStage};
use crate::obs;
use crate::orchestrator::outcome::{DeploymentOutcome, HostOutcome, HostResult};
use crate::orchestrator::plan::DeploymentPlan;
use crate::orchestrator::CancelSignal;
use crate::probe::HealthProbe;
use crate::registry::Host;
use crate::secrets::{ResolvedSecret, SecretResolver, SecretScope};

enum HostSlot {
    Running(HostId, JoinHandle<HostOutcome>),
    Done(HostOutcome),
}

fn skipped_by_abort() -> HostResult {
    HostResult::Skipped {
        reason: "fleet aborted".to_string(),
    }
}

/// Outcome for a host the run never handed to a worker.
fn not_started(host: &Host, result: HostResult) -> HostOutcome {
    let outcome = HostOutcome {
        host: host.id.clone(),
        result,
        duration_ms: 0,
    };
    obs::emit_host_finished(&outcome);
    outcome
}

struct Inner {
    store: Arc<GenerationStore>,
    pipeline: CheckPipeline,
    builder: Arc<dyn Builder>,
    resolver: SecretResolver,
    probe: Arc<dyn HealthProbe>,
    secrets_dir: PathBuf,
}

/// Drives deployment plans against the generation store.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<GenerationStore>,
        pipeline: CheckPipeline,
        builder: Arc<dyn Builder>,
        resolver: SecretResolver,
        probe: Arc<dyn HealthProbe>,
        secrets_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                pipeline,
                builder,
                resolver,
                probe,
                secrets_dir: secrets_dir.into(),
            }),
        }
    }

    pub fn store(&self) -> &GenerationStore {
        &self.inner.store
    }

    /// Deploy every host in the plan. Results come back in plan order.
    #[instrument(skip_all, fields(run_id = tracing::field::Empty, hosts = plan.hosts().len()))]
    pub async fn run(&self, plan: &DeploymentPlan, cancel: CancelSignal) -> DeploymentOutcome {
        let run_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("run_id", run_id.as_str());
        obs::emit_deploy_started(&run_id, plan.hosts().len(), plan.policy(), plan.concurrency());
        let started = Instant::now();

        let plan = Arc::new(plan.clone());
        let (abort_tx, abort_rx) = watch::channel(false);
        let abort_tx = Arc::new(abort_tx);
        let sem = Arc::new(Semaphore::new(plan.concurrency()));

        // Permits are taken here, in plan order, so no later host can start
        // ahead of an earlier one whatever the runtime's worker count.
        let mut slots = Vec::with_capacity(plan.hosts().len());
        for host in plan.hosts().iter().cloned() {
            let Ok(permit) = Arc::clone(&sem).acquire_owned().await else {
                slots.push(HostSlot::Done(not_started(&host, skipped_by_abort())));
                continue;
            };
            if *abort_rx.borrow() {
                slots.push(HostSlot::Done(not_started(&host, skipped_by_abort())));
                continue;
            }
            if cancel.is_cancelled() {
                let result = HostResult::Cancelled {
                    stage: "start".to_string(),
                };
                slots.push(HostSlot::Done(not_started(&host, result)));
                continue;
            }

            let this = self.clone();
            let plan = Arc::clone(&plan);
            let abort_tx = Arc::clone(&abort_tx);
            let cancel = cancel.clone();
            let host_id = host.id.clone();

            let task = tokio::spawn(async move {
                let start = Instant::now();
                obs::emit_host_started(&host.id);
                let result = this.deploy_host(&host, &plan, &cancel).await;

                if plan.policy().aborts_on_failure() && result.triggers_abort() {
                    let already = abort_tx.send_replace(true);
                    if !already {
                        obs::emit_fleet_aborted(&host.id, result.label());
                    }
                }
                drop(permit);

                let outcome = HostOutcome {
                    host: host.id.clone(),
                    result,
                    duration_ms: start.elapsed().as_millis() as u64,
                };
                obs::emit_host_finished(&outcome);
                outcome
            });
            slots.push(HostSlot::Running(host_id, task));
        }

        let mut hosts = Vec::with_capacity(slots.len());
        for slot in slots {
            let outcome = match slot {
                HostSlot::Done(outcome) => outcome,
                HostSlot::Running(host, task) => match task.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(host = %host, error = %e, "host worker did not complete");
                        HostOutcome {
                            host,
                            result: HostResult::ActivationFailed {
                                message: format!("host worker failed: {e}"),
                            },
                            duration_ms: 0,
                        }
                    }
                },
            };
            hosts.push(outcome);
        }

        let outcome = DeploymentOutcome {
            run_id,
            hosts,
            aborted: *abort_rx.borrow(),
            cancelled: cancel.is_cancelled(),
        };
        obs::emit_deploy_finished(&outcome, started.elapsed().as_millis() as u64);
        outcome
    }

    /// Run only the check pipeline, at most `concurrency` hosts at a time.
    pub async fn check(
        &self,
        hosts: &[Host],
        options: &CheckOptions,
        concurrency: usize,
    ) -> Vec<CheckReport> {
        stream::iter(hosts)
            .map(|host| self.inner.pipeline.run(host, options))
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    /// Re-activate `target` on `host` without rebuilding.
    #[instrument(skip(self, host), fields(host = %host.id))]
    pub async fn rollback(
        &self,
        host: &Host,
        target: u64,
        secrets_timeout: Duration,
    ) -> DeploymentOutcome {
        let run_id = Uuid::new_v4().to_string();
        let start = Instant::now();

        let result = match self.open_secrets(host, secrets_timeout).await {
            Err(result) => result,
            Ok((scope, context)) => {
                let rolled = self.inner.store.rollback(&host.id, target, &context).await;
                close_scope(scope, host);
                match rolled {
                    Ok(generation) => {
                        obs::emit_rolled_back(&host.id, generation.sequence, target);
                        HostResult::RolledBack {
                            generation: generation.sequence,
                            restored_from: target,
                        }
                    }
                    Err(RollbackError::Activation(e)) => HostResult::ActivationFailed {
                        message: e.to_string(),
                    },
                    Err(RollbackError::Store(e)) => HostResult::ActivationFailed {
                        message: e.to_string(),
                    },
                    Err(refused) => HostResult::RollbackRefused {
                        reason: refused.to_string(),
                    },
                }
            }
        };

        let outcome = HostOutcome {
            host: host.id.clone(),
            result,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        obs::emit_host_finished(&outcome);
        DeploymentOutcome::single(run_id, outcome)
    }

    async fn deploy_host(&self, host: &Host, plan: &DeploymentPlan, cancel: &CancelSignal) -> HostResult {
        if !host.reachable {
            return HostResult::Skipped {
                reason: "host marked unreachable".to_string(),
            };
        }
        let timeouts = plan.timeouts();

        let report = self.inner.pipeline.run(host, &plan.check_options()).await;
        let graph = match &report.graph {
            Some(graph) if report.clear_to_build() => graph.clone(),
            _ => {
                return HostResult::CheckedFailed {
                    stage: report.verdict.blocking_stage.unwrap_or(CheckStage::Eval),
                    diagnostics: report.blocking_diagnostics(),
                }
            }
        };

        if cancel.is_cancelled() {
            return cancelled("build");
        }
        let artifact = match tokio::time::timeout(timeouts.build, self.inner.builder.build(&graph)).await {
            Ok(Ok(artifact)) => artifact,
            Ok(Err(e)) => {
                return HostResult::BuildFailed {
                    message: e.message,
                    failed_step: e.failed_step,
                }
            }
            Err(_) => {
                return HostResult::BuildFailed {
                    message: format!("build timed out after {} seconds", timeouts.build.as_secs()),
                    failed_step: graph.derivation.clone(),
                }
            }
        };

        match self.inner.store.active(&host.id).await {
            Ok(Some(active)) if active.content_hash == artifact.content_hash => {
                obs::emit_deploy_unchanged(&host.id, active.sequence, &artifact.content_hash);
                return HostResult::Success {
                    generation: active.sequence,
                    changed: false,
                };
            }
            Ok(_) => {}
            Err(e) => {
                return HostResult::ActivationFailed {
                    message: e.to_string(),
                }
            }
        }

        if cancel.is_cancelled() {
            return cancelled("secrets");
        }
        let (scope, context) = match self.open_secrets(host, timeouts.secrets).await {
            Ok(opened) => opened,
            Err(result) => return result,
        };

        if cancel.is_cancelled() {
            return cancelled("activation");
        }
        let activated = self.activate(host, &artifact, &context).await;
        close_scope(scope, host);
        let generation = match activated {
            Ok(generation) => generation,
            Err(message) => return HostResult::ActivationFailed { message },
        };

        self.verify(host, &generation, timeouts.probe).await
    }

    async fn open_secrets(
        &self,
        host: &Host,
        limit: Duration,
    ) -> Result<(Option<SecretScope>, ActivationContext), HostResult> {
        if host.secrets.is_empty() {
            return Ok((None, ActivationContext::default()));
        }
        let failed = |message: String| HostResult::SecretsFailed { message };

        let mut scope =
            SecretScope::open(&self.inner.secrets_dir, &host.id).map_err(|e| failed(e.to_string()))?;
        let resolved = tokio::time::timeout(limit, self.inner.resolver.resolve(&host.secrets, &mut scope))
            .await
            .map_err(|_| failed(format!("secret resolution timed out after {} seconds", limit.as_secs())))?
            .map_err(|e| failed(e.to_string()))?;

        let mounts = resolved.iter().map(ResolvedSecret::mount).collect();
        Ok((Some(scope), ActivationContext::with_secrets(mounts)))
    }

    async fn activate(
        &self,
        host: &Host,
        artifact: &Artifact,
        context: &ActivationContext,
    ) -> Result<Generation, String> {
        let store = &self.inner.store;
        let pending = store
            .record(&host.id, artifact)
            .await
            .map_err(|e| e.to_string())?;
        store
            .activate(&pending, context)
            .await
            .map_err(|e| e.to_string())
    }

    async fn verify(&self, host: &Host, generation: &Generation, limit: Duration) -> HostResult {
        let Some(url) = &host.health_url else {
            return HostResult::Success {
                generation: generation.sequence,
                changed: true,
            };
        };
        let reason = match tokio::time::timeout(limit, self.inner.probe.probe(&host.id, url)).await {
            Ok(Ok(())) => {
                return HostResult::Success {
                    generation: generation.sequence,
                    changed: true,
                }
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("health probe timed out after {} seconds", limit.as_secs()),
        };
        warn!(host = %host.id, generation = generation.sequence, %reason, "activation unverified");
        HostResult::ActivationSucceededButUnverified {
            generation: generation.sequence,
            reason,
        }
    }
}

fn cancelled(stage: &str) -> HostResult {
    HostResult::Cancelled {
        stage: stage.to_string(),
    }
}

fn close_scope(scope: Option<SecretScope>, host: &Host) {
    if let Some(scope) = scope {
        if let Err(e) = scope.close() {
            warn!(host = %host.id, error = %e, "secret scope cleanup failed");
        }
    }
}
