//! Per-host results and the aggregated fleet outcome.

use generation_store::HostId;
use serde::Serialize;

use crate::check::CheckStage;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL_FAILURE: i32 = 1;
pub const EXIT_ABORTED: i32 = 2;
pub const EXIT_INVALID: i32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum HostResult {
    /// `changed = false` when the built artifact was already active.
    Success { generation: u64, changed: bool },
    CheckedFailed {
        stage: CheckStage,
        diagnostics: Vec<String>,
    },
    BuildFailed { message: String, failed_step: String },
    SecretsFailed { message: String },
    ActivationFailed { message: String },
    ActivationSucceededButUnverified { generation: u64, reason: String },
    RolledBack { generation: u64, restored_from: u64 },
    RollbackRefused { reason: String },
    Skipped { reason: String },
    /// Operator cancellation observed before `stage`
    Cancelled { stage: String },
}

impl HostResult {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            HostResult::Success { .. } | HostResult::RolledBack { .. }
        )
    }

    /// Failures that stop the fleet under abort-on-first-failure.
    pub fn triggers_abort(&self) -> bool {
        matches!(
            self,
            HostResult::CheckedFailed { .. }
                | HostResult::BuildFailed { .. }
                | HostResult::SecretsFailed { .. }
                | HostResult::ActivationFailed { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            HostResult::Success { changed: true, .. } => "success",
            HostResult::Success { changed: false, .. } => "unchanged",
            HostResult::CheckedFailed { .. } => "checked-failed",
            HostResult::BuildFailed { .. } => "build-failed",
            HostResult::SecretsFailed { .. } => "secrets-failed",
            HostResult::ActivationFailed { .. } => "activation-failed",
            HostResult::ActivationSucceededButUnverified { .. } => "unverified",
            HostResult::RolledBack { .. } => "rolled-back",
            HostResult::RollbackRefused { .. } => "rollback-refused",
            HostResult::Skipped { .. } => "skipped",
            HostResult::Cancelled { .. } => "cancelled",
        }
    }
}

impl std::fmt::Display for HostResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostResult::Success {
                generation,
                changed: true,
            } => write!(f, "success (generation {generation})"),
            HostResult::Success {
                generation,
                changed: false,
            } => write!(f, "unchanged (generation {generation} already active)"),
            HostResult::CheckedFailed { stage, diagnostics } => {
                write!(f, "checked-failed({stage})")?;
                if let Some(first) = diagnostics.first() {
                    write!(f, ": {first}")?;
                }
                Ok(())
            }
            HostResult::BuildFailed {
                message,
                failed_step,
            } => write!(f, "build-failed at {failed_step}: {message}"),
            HostResult::SecretsFailed { message } => write!(f, "secrets-failed: {message}"),
            HostResult::ActivationFailed { message } => write!(f, "activation-failed: {message}"),
            HostResult::ActivationSucceededButUnverified { generation, reason } => write!(
                f,
                "activation-succeeded-but-unverified (generation {generation}): {reason}"
            ),
            HostResult::RolledBack {
                generation,
                restored_from,
            } => write!(
                f,
                "rolled-back (generation {generation} restores {restored_from})"
            ),
            HostResult::RollbackRefused { reason } => write!(f, "rollback refused: {reason}"),
            HostResult::Skipped { reason } => write!(f, "skipped: {reason}"),
            HostResult::Cancelled { stage } => write!(f, "cancelled before {stage}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostOutcome {
    pub host: HostId,
    #[serde(flatten)]
    pub result: HostResult,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FleetStatus {
    Succeeded,
    PartiallyFailed,
    Aborted,
    Cancelled,
}

/// Everything one invocation did, in plan order.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentOutcome {
    pub run_id: String,
    pub hosts: Vec<HostOutcome>,
    pub aborted: bool,
    pub cancelled: bool,
}

impl DeploymentOutcome {
    pub fn single(run_id: impl Into<String>, outcome: HostOutcome) -> Self {
        Self {
            run_id: run_id.into(),
            hosts: vec![outcome],
            aborted: false,
            cancelled: false,
        }
    }

    pub fn get(&self, host: &str) -> Option<&HostResult> {
        self.hosts
            .iter()
            .find(|o| o.host.as_str() == host)
            .map(|o| &o.result)
    }

    pub fn status(&self) -> FleetStatus {
        if self.aborted {
            FleetStatus::Aborted
        } else if self.cancelled {
            FleetStatus::Cancelled
        } else if self.hosts.iter().all(|o| o.result.is_success()) {
            FleetStatus::Succeeded
        } else {
            FleetStatus::PartiallyFailed
        }
    }

    /// Process exit code: 0 all succeeded, 2 aborted, 1 anything else short of success.
    pub fn exit_code(&self) -> i32 {
        match self.status() {
            FleetStatus::Succeeded => EXIT_SUCCESS,
            FleetStatus::Aborted => EXIT_ABORTED,
            FleetStatus::PartiallyFailed | FleetStatus::Cancelled => EXIT_PARTIAL_FAILURE,
        }
    }
}
