//! Structured lifecycle events for deployments.
//!
//! Every event carries an `event` field (`deploy.started`,
//! `deploy.host_finished`, ...) so JSON log consumers can filter on it.
//! Secret contents never pass through here.

use generation_store::{ContentHash, HostId};
use tracing::{info, warn};

use crate::check::{CheckOutcome, CheckStage};
use crate::orchestrator::{DeploymentOutcome, HostOutcome, RollbackPolicy};

/// Emit event: deployment started.
pub fn emit_deploy_started(run_id: &str, hosts: usize, policy: RollbackPolicy, concurrency: usize) {
    info!(
        event = "deploy.started",
        run_id = %run_id,
        hosts = hosts,
        policy = ?policy,
        concurrency = concurrency,
    );
}

/// Emit event: deployment finished with fleet-level status.
pub fn emit_deploy_finished(outcome: &DeploymentOutcome, duration_ms: u64) {
    let failed = outcome
        .hosts
        .iter()
        .filter(|o| !o.result.is_success())
        .count();
    info!(
        event = "deploy.finished",
        run_id = %outcome.run_id,
        status = ?outcome.status(),
        hosts = outcome.hosts.len(),
        failed = failed,
        duration_ms = duration_ms,
        exit_code = outcome.exit_code(),
    );
}

pub fn emit_host_started(host: &HostId) {
    info!(event = "deploy.host_started", host = %host);
}

pub fn emit_host_finished(outcome: &HostOutcome) {
    if outcome.result.is_success() {
        info!(
            event = "deploy.host_finished",
            host = %outcome.host,
            result = outcome.result.label(),
            duration_ms = outcome.duration_ms,
        );
    } else {
        warn!(
            event = "deploy.host_finished",
            host = %outcome.host,
            result = outcome.result.label(),
            detail = %outcome.result,
            duration_ms = outcome.duration_ms,
        );
    }
}

pub fn emit_check_stage(host: &HostId, stage: CheckStage, outcome: CheckOutcome, duration_ms: u64) {
    info!(
        event = "check.stage",
        host = %host,
        stage = stage.name(),
        outcome = ?outcome,
        duration_ms = duration_ms,
    );
}

/// Emit event: built artifact already active, nothing recorded.
pub fn emit_deploy_unchanged(host: &HostId, generation: u64, hash: &ContentHash) {
    info!(
        event = "deploy.unchanged",
        host = %host,
        generation = generation,
        hash = hash.short(),
    );
}

/// Emit event: first abort-triggering failure (warning level).
pub fn emit_fleet_aborted(host: &HostId, result: &str) {
    warn!(event = "deploy.aborted", host = %host, result = %result);
}

pub fn emit_rolled_back(host: &HostId, generation: u64, restored_from: u64) {
    info!(
        event = "deploy.rolled_back",
        host = %host,
        generation = generation,
        restored_from = restored_from,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::HostResult;

    #[test]
    fn test_emitters_do_not_panic_without_subscriber() {
        let host = HostId::new("web1").unwrap();
        emit_host_started(&host);
        emit_check_stage(&host, CheckStage::Eval, CheckOutcome::Pass, 3);
        emit_deploy_unchanged(&host, 4, &ContentHash::from_bytes(b"x"));
        emit_fleet_aborted(&host, "build-failed");
        emit_rolled_back(&host, 6, 3);
        let outcome = HostOutcome {
            host: host.clone(),
            result: HostResult::Skipped {
                reason: "unreachable".into(),
            },
            duration_ms: 0,
        };
        emit_host_finished(&outcome);
        emit_deploy_finished(&DeploymentOutcome::single("run", outcome), 10);
        emit_deploy_started("run", 1, RollbackPolicy::BestEffortContinue, 1);
    }
}
