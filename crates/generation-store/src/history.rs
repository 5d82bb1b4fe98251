//! Replayed view of a single host's generation log.
//!
//! Generations live in a `Vec` indexed by `sequence - 1`, and every
//! predecessor points at the previous index, so the history is one linear
//! chain by construction.

use crate::error::StoreError;
use crate::schema::{Generation, GenerationStatus, HostId, LogRecord};
use crate::StoreResult;

#[derive(Debug, Clone)]
pub struct HostHistory {
    host: HostId,
    generations: Vec<Generation>,
    /// Set when a log append failed; memory may no longer match the log.
    needs_replay: bool,
}

impl HostHistory {
    pub fn new(host: HostId) -> Self {
        Self {
            host,
            generations: Vec::new(),
            needs_replay: false,
        }
    }

    /// Rebuild a history from persisted records, validating every line.
    pub fn replay(host: HostId, records: &[LogRecord]) -> StoreResult<Self> {
        let mut history = Self::new(host);
        for record in records {
            history.apply(record)?;
        }
        Ok(history)
    }

    pub fn host(&self) -> &HostId {
        &self.host
    }

    pub fn generations(&self) -> &[Generation] {
        &self.generations
    }

    pub fn get(&self, sequence: u64) -> Option<&Generation> {
        if sequence == 0 {
            return None;
        }
        self.generations.get((sequence - 1) as usize)
    }

    pub fn head(&self) -> Option<&Generation> {
        self.generations.last()
    }

    pub fn next_sequence(&self) -> u64 {
        self.generations.len() as u64 + 1
    }

    pub fn active(&self) -> Option<&Generation> {
        self.generations
            .iter()
            .rev()
            .find(|g| g.status == GenerationStatus::Active)
    }

    pub fn pending(&self) -> Option<&Generation> {
        self.head()
            .filter(|g| g.status == GenerationStatus::Pending)
    }

    /// Sequence numbers reachable from `from` through predecessor links,
    /// starting with `from` itself.
    ///
    /// Stops with `Err(missing)` if a link points at an absent generation.
    pub fn lineage(&self, from: u64) -> Result<Vec<u64>, u64> {
        let mut chain = Vec::new();
        let mut cursor = Some(from);
        while let Some(seq) = cursor {
            let generation = self.get(seq).ok_or(seq)?;
            chain.push(seq);
            cursor = generation.predecessor;
        }
        Ok(chain)
    }

    /// The chain of configurations that actually led to `from`.
    ///
    /// Like [`lineage`](Self::lineage), but a restoring generation continues
    /// at the generation it restored, so generations undone by a rollback
    /// are not part of it.
    pub fn effective_lineage(&self, from: u64) -> Result<Vec<u64>, u64> {
        let mut chain = Vec::new();
        let mut cursor = Some(from);
        while let Some(seq) = cursor {
            let generation = self.get(seq).ok_or(seq)?;
            chain.push(seq);
            cursor = generation.restored_from.or(generation.predecessor);
        }
        Ok(chain)
    }

    pub fn needs_replay(&self) -> bool {
        self.needs_replay
    }

    pub fn mark_needs_replay(&mut self) {
        self.needs_replay = true;
    }

    /// Apply one log record, enforcing the state machine and chain rules.
    pub fn apply(&mut self, record: &LogRecord) -> StoreResult<()> {
        let expected = self.next_sequence();

        if record.sequence == expected {
            return self.apply_new(record);
        }
        if record.sequence == 0 || record.sequence > expected {
            return Err(StoreError::SequenceGap {
                host: self.host.clone(),
                expected,
                found: record.sequence,
            });
        }
        self.apply_transition(record)
    }

    fn apply_new(&mut self, record: &LogRecord) -> StoreResult<()> {
        let sequence = record.sequence;
        let expected_predecessor = if sequence == 1 {
            None
        } else {
            Some(sequence - 1)
        };
        if record.predecessor != expected_predecessor {
            return Err(StoreError::BrokenChain {
                host: self.host.clone(),
                sequence,
                predecessor: record.predecessor,
            });
        }

        // Rollbacks append their generation directly as active; everything
        // else starts out pending.
        let valid_start = match record.status {
            GenerationStatus::Pending => record.restored_from.is_none(),
            GenerationStatus::Active => record.restored_from.is_some_and(|t| t < sequence),
            _ => false,
        };
        if !valid_start {
            return Err(StoreError::InvalidTransition {
                host: self.host.clone(),
                sequence,
                from: GenerationStatus::Pending,
                to: record.status,
            });
        }
        if record.status == GenerationStatus::Active {
            self.ensure_no_other_active(sequence)?;
        }

        let activated_at = (record.status == GenerationStatus::Active).then_some(record.timestamp);
        self.generations.push(Generation {
            host: self.host.clone(),
            sequence,
            content_hash: record.content_hash.clone(),
            artifact_path: record.artifact_path.clone(),
            recorded_at: record.timestamp,
            activated_at,
            status: record.status,
            predecessor: record.predecessor,
            restored_from: record.restored_from,
        });
        Ok(())
    }

    fn apply_transition(&mut self, record: &LogRecord) -> StoreResult<()> {
        let sequence = record.sequence;
        if record.status == GenerationStatus::Active {
            self.ensure_no_other_active(sequence)?;
        }

        let host = self.host.clone();
        let generation = &mut self.generations[(sequence - 1) as usize];
        if generation.content_hash != record.content_hash {
            return Err(StoreError::HashMismatch { host, sequence });
        }
        if !generation.status.can_transition_to(record.status) {
            return Err(StoreError::InvalidTransition {
                host,
                sequence,
                from: generation.status,
                to: record.status,
            });
        }

        generation.status = record.status;
        if record.status == GenerationStatus::Active {
            generation.activated_at = Some(record.timestamp);
        }
        Ok(())
    }

    fn ensure_no_other_active(&self, incoming: u64) -> StoreResult<()> {
        match self.active() {
            Some(current) if current.sequence != incoming => Err(StoreError::MultipleActive {
                host: self.host.clone(),
                current: current.sequence,
                incoming,
            }),
            _ => Ok(()),
        }
    }
}
