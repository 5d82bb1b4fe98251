//! Seams to the external evaluator and builder.
//!
//! The orchestrator only ever sees these traits; [`nix`] provides the
//! production implementations and [`crate::fakes`] the test doubles.

pub mod nix;

use async_trait::async_trait;
use generation_store::{Artifact, HostId};
use serde::{Deserialize, Serialize};

use crate::error::{BuildError, EvalError};
use crate::registry::Host;

/// A configuration resolved far enough to build, without building it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatedGraph {
    pub host: HostId,
    /// What was evaluated, e.g. a flake installable
    pub installable: String,
    /// Builder-defined handle on the resolved graph (a `.drv` path for Nix)
    pub derivation: String,
}

/// Resolves a host configuration reference into a buildable graph.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, host: &Host) -> Result<EvaluatedGraph, EvalError>;
}

/// Realises an evaluated graph into an addressable artifact.
///
/// Identical graphs must yield identical content hashes.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, graph: &EvaluatedGraph) -> Result<Artifact, BuildError>;
}
