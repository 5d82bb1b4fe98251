//! Generation-Store: durable per-host configuration history for fleetgen
//!
//! This crate owns the generation state machine. Every configuration applied
//! to a host is recorded as a numbered generation in an append-only log, and
//! the store is the only component allowed to switch a host between them.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: single active generation per host, gapless linear history, and
//! all-or-nothing activation and rollback.
//!
//! ## Key Components
//!
//! - `GenerationStore`: per-host critical sections around record/activate/rollback
//! - `GenerationLog`: append-only persistence (filesystem or in-memory)
//! - `Activator`: host-side switch boundary
//! - `HostHistory`: replayed view of one host's log

mod error;
pub mod fakes;
pub mod fs_log;
mod history;
mod schema;
pub mod storage_traits;
mod store;

pub use error::{ActivationError, RollbackError, StoreError};
pub use fs_log::FsGenerationLog;
pub use history::HostHistory;
pub use schema::{Artifact, ContentHash, Generation, GenerationStatus, HostId, LogRecord};
pub use storage_traits::{ActivationContext, Activator, GenerationLog, SecretMount};
pub use store::GenerationStore;

/// Result type for generation-store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;
