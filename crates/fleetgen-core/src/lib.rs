//! Fleetgen-Core: host registry, check pipeline and fleet orchestration
//!
//! Drives a set of hosts from declarative configuration to an active,
//! verified generation. Everything durable goes through
//! `generation_store::GenerationStore`.
//!
//! ## Layer 1 - Orchestration
//!
//! Focus: bounded parallel rollout, abort-on-first-failure semantics, and
//! plaintext secrets that never outlive a single activation.
//!
//! ## Key Components
//!
//! - `HostRegistry`: validated fleet inventory from `fleet.toml`
//! - `CheckPipeline`: lint, eval and test stages gated before any build
//! - `SecretResolver` / `SecretScope`: per-activation plaintext lifecycle
//! - `Orchestrator`: per-host workers with rollback policy and cancellation
//! - `adapters::nix`: evaluator, builder and activator backed by the nix CLI

pub mod adapters;
pub mod check;
pub mod config;
pub mod error;
pub mod fakes;
pub mod obs;
pub mod orchestrator;
pub mod probe;
pub mod registry;
pub mod secrets;
pub mod telemetry;

pub use adapters::{Builder, EvaluatedGraph, Evaluator};
pub use check::{CheckGate, CheckOptions, CheckPipeline, CheckReport, CheckStage, GateVerdict};
pub use config::FleetConfig;
pub use error::{BuildError, ConfigError, EvalError, FleetError, FleetResult, SecretError};
pub use orchestrator::{
    cancellation, CancelHandle, CancelSignal, DeploymentOutcome, DeploymentPlan, FleetStatus,
    HostOutcome, HostResult, Orchestrator, RollbackPolicy, StageTimeouts,
};
pub use probe::{HealthProbe, HttpHealthProbe};
pub use registry::{Host, HostRegistry};
pub use secrets::{CommandSecretBackend, SecretBackend, SecretRef, SecretResolver, SecretScope};
pub use telemetry::init_tracing;
