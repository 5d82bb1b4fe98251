//! Nix-Fleet-Adapter: Nix CLI integration for fleetgen
//!
//! This crate drives the `nix` command line on behalf of the orchestrator:
//! resolving a host's configuration to a derivation, realising it into a
//! store path, and switching a (possibly remote) host to that path.
//!
//! ## Layer 2 - Environment/Tooling
//!
//! Focus: deterministic store paths, readable diagnostics from Nix errors,
//! and all-or-nothing profile switches.

pub mod command;
pub mod error;
pub mod flake;
pub mod switch;

pub use command::{CommandOutput, NixCli};
pub use error::NixError;
pub use flake::{content_hash_of, BuiltPath, EvaluatedDrv, Platform};
pub use switch::{SecretFile, SwitchTarget, Switcher};

/// Result type for nix-fleet-adapter operations
pub type Result<T> = std::result::Result<T, NixError>;

/// Whether a `nix` binary is callable.
pub async fn is_nix_available() -> bool {
    NixCli::default().version().await.is_ok()
}
