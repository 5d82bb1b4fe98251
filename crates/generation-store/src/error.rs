//! Error types for generation-store

use thiserror::Error;

use crate::schema::{GenerationStatus, HostId};

/// Errors raised by the generation log and its replay
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem error while reading or appending a log
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// A persisted line could not be decoded
    #[error("Corrupt generation log for {host} at line {line}: {reason}")]
    CorruptLog {
        host: HostId,
        line: usize,
        reason: String,
    },

    /// A record introduced a sequence number out of order
    #[error("Sequence gap for {host}: expected generation {expected}, found {found}")]
    SequenceGap {
        host: HostId,
        expected: u64,
        found: u64,
    },

    /// A record's predecessor does not point at the previous generation
    #[error("Generation {sequence} of {host} has invalid predecessor {predecessor:?}")]
    BrokenChain {
        host: HostId,
        sequence: u64,
        predecessor: Option<u64>,
    },

    /// A status change that the state machine forbids
    #[error("Generation {sequence} of {host} cannot move from {from} to {to}")]
    InvalidTransition {
        host: HostId,
        sequence: u64,
        from: GenerationStatus,
        to: GenerationStatus,
    },

    /// A second generation would become active
    #[error("Host {host} would have two active generations ({current} and {incoming})")]
    MultipleActive {
        host: HostId,
        current: u64,
        incoming: u64,
    },

    /// A status record disagrees with the generation's recorded artifact
    #[error("Generation {sequence} of {host} changed content hash in the log")]
    HashMismatch { host: HostId, sequence: u64 },

    /// `record` was called while an earlier attempt is still pending
    #[error("Host {host} already has pending generation {sequence}")]
    PendingInFlight { host: HostId, sequence: u64 },

    /// Lookup of an unknown generation
    #[error("Generation {sequence} not found for host {host}")]
    GenerationNotFound { host: HostId, sequence: u64 },

    /// Host id unusable as a log name
    #[error("Invalid host id: {id:?}")]
    InvalidHostId { id: String },

    /// Content hash is not a 64-char hex digest
    #[error("Invalid content hash: {hash}")]
    InvalidHash { hash: String },
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Errors from `GenerationStore::activate`.
///
/// On every variant except `Unrecorded` the host keeps its last-known-good
/// active generation.
#[derive(Error, Debug)]
pub enum ActivationError {
    #[error("generation {sequence} of {host} is {status}, only pending generations can be activated")]
    NotPending {
        host: HostId,
        sequence: u64,
        status: GenerationStatus,
    },

    #[error("generation {sequence} of {host} is not the newest record (head is {head})")]
    NotHead {
        host: HostId,
        sequence: u64,
        head: u64,
    },

    #[error("switching {host} to generation {sequence} failed: {reason}")]
    SwitchFailed {
        host: HostId,
        sequence: u64,
        reason: String,
    },

    /// The switch went through but the log append did not.
    #[error("{host} switched to generation {sequence} but recording it failed: {reason}")]
    Unrecorded {
        host: HostId,
        sequence: u64,
        reason: String,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from `GenerationStore::rollback`.
///
/// Refusals leave both the log and the host untouched.
#[derive(Error, Debug)]
pub enum RollbackError {
    #[error("host {host} has no active generation to roll back from")]
    NoActiveGeneration { host: HostId },

    #[error("generation {target} is not an ancestor of active generation {active} on {host}")]
    NotAnAncestor {
        host: HostId,
        target: u64,
        active: u64,
    },

    #[error("history of {host} is missing generation {missing}; cannot roll back across the gap")]
    PrunedGap { host: HostId, missing: u64 },

    #[error("generation {target} of {host} was never activated ({status})")]
    NeverActivated {
        host: HostId,
        target: u64,
        status: GenerationStatus,
    },

    #[error("generation {target} of {host} was undone by an earlier rollback")]
    RolledBackTarget { host: HostId, target: u64 },

    #[error("generation {target} of {host} has the artifact active generation {active} already runs")]
    AlreadyActive {
        host: HostId,
        target: u64,
        active: u64,
    },

    #[error("artifact for generation {target} of {host} is missing: {path}")]
    ArtifactMissing {
        host: HostId,
        target: u64,
        path: String,
    },

    #[error("host {host} has pending generation {sequence} in flight")]
    PendingInFlight { host: HostId, sequence: u64 },

    #[error("activation error: {0}")]
    Activation(#[from] ActivationError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
