//! Generation store: the only writer of host generation state.
//!
//! Each host has its own async critical section, taken around
//! `record`/`activate`/`rollback` only. Hosts never share a lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OnceCell, OwnedMutexGuard};
use tracing::{info, instrument, warn};

use crate::error::{ActivationError, RollbackError, StoreError};
use crate::history::HostHistory;
use crate::schema::{Artifact, Generation, GenerationStatus, HostId, LogRecord};
use crate::storage_traits::{ActivationContext, Activator, GenerationLog};
use crate::StoreResult;

type HostSlot = Arc<OnceCell<Arc<AsyncMutex<HostHistory>>>>;

pub struct GenerationStore {
    log: Arc<dyn GenerationLog>,
    activator: Arc<dyn Activator>,
    slots: Mutex<HashMap<HostId, HostSlot>>,
}

impl GenerationStore {
    pub fn new(log: Arc<dyn GenerationLog>, activator: Arc<dyn Activator>) -> Self {
        Self {
            log,
            activator,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, host: &HostId) -> HostSlot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slots.entry(host.clone()).or_default())
    }

    /// Enter the host's critical section, replaying its log on first use
    /// and after any failed append.
    async fn lock_host(&self, host: &HostId) -> StoreResult<OwnedMutexGuard<HostHistory>> {
        let slot = self.slot(host);
        let history = slot
            .get_or_try_init(|| async {
                Ok::<_, StoreError>(Arc::new(AsyncMutex::new(self.load_history(host).await?)))
            })
            .await?
            .clone();
        let mut guard = history.lock_owned().await;
        if guard.needs_replay() {
            warn!(host = %host, "Replaying generation log after a failed append");
            *guard = self.load_history(host).await?;
        }
        Ok(guard)
    }

    async fn load_history(&self, host: &HostId) -> StoreResult<HostHistory> {
        let records = self.log.load(host).await?;
        let mut history = HostHistory::replay(host.clone(), &records)?;

        // A pending head at load time belongs to an activation that never
        // got its outcome recorded.
        if let Some(stale) = history.pending().cloned() {
            warn!(host = %host, sequence = stale.sequence, "Discarding stale pending generation");
            self.commit(
                &mut history,
                vec![LogRecord::transition(&stale, GenerationStatus::Discarded)],
            )
            .await?;
        }
        Ok(history)
    }

    /// Validate records against a copy of the history, persist, then publish.
    ///
    /// A failed append leaves `history` untouched but flagged, so the next
    /// caller rebuilds it from whatever the log actually holds.
    async fn commit(&self, history: &mut HostHistory, records: Vec<LogRecord>) -> StoreResult<()> {
        let mut next = history.clone();
        for record in &records {
            next.apply(record)?;
        }
        if let Err(e) = self.log.append(next.host(), &records).await {
            history.mark_needs_replay();
            return Err(e);
        }
        *history = next;
        Ok(())
    }

    /// Allocate the next generation for `host` with status `pending`.
    #[instrument(skip(self, artifact), fields(host = %host, hash = %artifact.content_hash.short()))]
    pub async fn record(&self, host: &HostId, artifact: &Artifact) -> StoreResult<Generation> {
        let mut history = self.lock_host(host).await?;
        if let Some(pending) = history.pending() {
            return Err(StoreError::PendingInFlight {
                host: host.clone(),
                sequence: pending.sequence,
            });
        }

        let sequence = history.next_sequence();
        let record = LogRecord {
            sequence,
            content_hash: artifact.content_hash.clone(),
            artifact_path: artifact.path.clone(),
            timestamp: Utc::now(),
            status: GenerationStatus::Pending,
            predecessor: (sequence > 1).then(|| sequence - 1),
            restored_from: None,
        };
        self.commit(&mut history, vec![record]).await?;

        info!(event = "generation.recorded", host = %host, sequence = sequence);
        history
            .get(sequence)
            .cloned()
            .ok_or_else(|| StoreError::GenerationNotFound {
                host: host.clone(),
                sequence,
            })
    }

    /// Switch the host to a pending generation.
    ///
    /// On success the previous active generation becomes `superseded`. On
    /// failure the attempt becomes `discarded` and the previous active
    /// generation is left as it was.
    #[instrument(skip(self, generation, context), fields(host = %generation.host, sequence = generation.sequence))]
    pub async fn activate(
        &self,
        generation: &Generation,
        context: &ActivationContext,
    ) -> Result<Generation, ActivationError> {
        let host = &generation.host;
        let sequence = generation.sequence;
        let mut history = self.lock_host(host).await?;

        let current = history
            .get(sequence)
            .cloned()
            .ok_or_else(|| StoreError::GenerationNotFound {
                host: host.clone(),
                sequence,
            })?;
        if current.status != GenerationStatus::Pending {
            return Err(ActivationError::NotPending {
                host: host.clone(),
                sequence,
                status: current.status,
            });
        }
        let head = history.next_sequence() - 1;
        if head != sequence {
            return Err(ActivationError::NotHead {
                host: host.clone(),
                sequence,
                head,
            });
        }
        let previous = history.active().cloned();

        if let Err(e) = self
            .activator
            .switch(host, &current.artifact(), context)
            .await
        {
            let reason = format!("{e:#}");
            warn!(host = %host, sequence = sequence, error = %reason, "Activation failed");
            if let Err(store_err) = self
                .commit(
                    &mut history,
                    vec![LogRecord::transition(&current, GenerationStatus::Discarded)],
                )
                .await
            {
                warn!(host = %host, error = %store_err, "Failed to record discarded generation");
            }
            return Err(ActivationError::SwitchFailed {
                host: host.clone(),
                sequence,
                reason,
            });
        }

        let mut records = Vec::with_capacity(2);
        if let Some(prev) = &previous {
            records.push(LogRecord::transition(prev, GenerationStatus::Superseded));
        }
        records.push(LogRecord::transition(&current, GenerationStatus::Active));
        if let Err(e) = self.commit(&mut history, records).await {
            warn!(host = %host, sequence = sequence, error = %e, "Activation not recorded");
            return Err(ActivationError::Unrecorded {
                host: host.clone(),
                sequence,
                reason: e.to_string(),
            });
        }

        info!(
            event = "generation.activated",
            host = %host,
            sequence = sequence,
            previous = previous.as_ref().map(|g| g.sequence),
        );
        Ok(history
            .get(sequence)
            .cloned()
            .ok_or_else(|| StoreError::GenerationNotFound {
                host: host.clone(),
                sequence,
            })?)
    }

    /// Re-activate the artifact of an ancestor of the active generation.
    ///
    /// Ancestry follows `restored_from` where present, so generations undone
    /// by an earlier rollback are never targets. Appends a new `active` generation with `restored_from = target` and
    /// marks every live-or-superseded generation after `target` as
    /// `rolled-back`. Refusals change nothing.
    #[instrument(skip(self, context), fields(host = %host, target = target))]
    pub async fn rollback(
        &self,
        host: &HostId,
        target: u64,
        context: &ActivationContext,
    ) -> Result<Generation, RollbackError> {
        let mut history = self.lock_host(host).await?;

        if let Some(pending) = history.pending() {
            return Err(RollbackError::PendingInFlight {
                host: host.clone(),
                sequence: pending.sequence,
            });
        }
        let active = history
            .active()
            .cloned()
            .ok_or_else(|| RollbackError::NoActiveGeneration { host: host.clone() })?;
        let not_ancestor = || RollbackError::NotAnAncestor {
            host: host.clone(),
            target,
            active: active.sequence,
        };
        if target >= active.sequence {
            return Err(not_ancestor());
        }
        let restored = history.get(target).cloned().ok_or_else(not_ancestor)?;
        if restored.status == GenerationStatus::RolledBack {
            return Err(RollbackError::RolledBackTarget {
                host: host.clone(),
                target,
            });
        }
        let lineage = history
            .effective_lineage(active.sequence)
            .map_err(|missing| RollbackError::PrunedGap {
                host: host.clone(),
                missing,
            })?;
        if !lineage.contains(&target) {
            return Err(not_ancestor());
        }
        if !restored.status.was_activated() {
            return Err(RollbackError::NeverActivated {
                host: host.clone(),
                target,
                status: restored.status,
            });
        }
        if restored.content_hash == active.content_hash {
            return Err(RollbackError::AlreadyActive {
                host: host.clone(),
                target,
                active: active.sequence,
            });
        }

        let sequence = history.next_sequence();
        let artifact = restored.artifact();
        let exists = self
            .activator
            .artifact_exists(host, &artifact)
            .await
            .map_err(|e| ActivationError::SwitchFailed {
                host: host.clone(),
                sequence,
                reason: format!("artifact check failed: {e:#}"),
            })?;
        if !exists {
            return Err(RollbackError::ArtifactMissing {
                host: host.clone(),
                target,
                path: artifact.path.display().to_string(),
            });
        }

        self.activator
            .switch(host, &artifact, context)
            .await
            .map_err(|e| ActivationError::SwitchFailed {
                host: host.clone(),
                sequence,
                reason: format!("{e:#}"),
            })?;

        let mut records: Vec<LogRecord> = history
            .generations()
            .iter()
            .filter(|g| g.sequence > target)
            .filter(|g| {
                matches!(
                    g.status,
                    GenerationStatus::Active | GenerationStatus::Superseded
                )
            })
            .map(|g| LogRecord::transition(g, GenerationStatus::RolledBack))
            .collect();
        let rolled_back = records.len();
        records.push(LogRecord {
            sequence,
            content_hash: restored.content_hash.clone(),
            artifact_path: restored.artifact_path.clone(),
            timestamp: Utc::now(),
            status: GenerationStatus::Active,
            predecessor: Some(sequence - 1),
            restored_from: Some(target),
        });
        if let Err(e) = self.commit(&mut history, records).await {
            warn!(host = %host, sequence = sequence, error = %e, "Rollback not recorded");
            return Err(ActivationError::Unrecorded {
                host: host.clone(),
                sequence,
                reason: e.to_string(),
            }
            .into());
        }

        info!(
            event = "generation.rolled_back",
            host = %host,
            target = target,
            from = active.sequence,
            sequence = sequence,
            rolled_back = rolled_back,
        );
        Ok(history
            .get(sequence)
            .cloned()
            .ok_or_else(|| StoreError::GenerationNotFound {
                host: host.clone(),
                sequence,
            })?)
    }

    /// Full history for a host, oldest first.
    pub async fn history(&self, host: &HostId) -> StoreResult<Vec<Generation>> {
        let history = self.lock_host(host).await?;
        Ok(history.generations().to_vec())
    }

    /// The host's active generation, if any.
    pub async fn active(&self, host: &HostId) -> StoreResult<Option<Generation>> {
        let history = self.lock_host(host).await?;
        Ok(history.active().cloned())
    }

    /// The predecessor chain from the active generation back to generation 1.
    pub async fn lineage(&self, host: &HostId) -> StoreResult<Vec<Generation>> {
        let history = self.lock_host(host).await?;
        let Some(active) = history.active() else {
            return Ok(Vec::new());
        };
        let chain = history
            .lineage(active.sequence)
            .map_err(|missing| StoreError::GenerationNotFound {
                host: host.clone(),
                sequence: missing,
            })?;
        Ok(chain
            .into_iter()
            .filter_map(|seq| history.get(seq).cloned())
            .collect())
    }

    /// The chain of generations that led to the active one, skipping those
    /// undone by a rollback.
    pub async fn effective_lineage(&self, host: &HostId) -> StoreResult<Vec<Generation>> {
        let history = self.lock_host(host).await?;
        let Some(active) = history.active() else {
            return Ok(Vec::new());
        };
        let chain = history
            .effective_lineage(active.sequence)
            .map_err(|missing| StoreError::GenerationNotFound {
                host: host.clone(),
                sequence: missing,
            })?;
        Ok(chain
            .into_iter()
            .filter_map(|seq| history.get(seq).cloned())
            .collect())
    }

    /// Hosts with recorded history.
    pub async fn hosts(&self) -> StoreResult<Vec<HostId>> {
        self.log.hosts().await
    }
}
