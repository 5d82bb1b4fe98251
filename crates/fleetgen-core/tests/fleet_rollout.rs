//! End-to-end rollout behaviour over in-memory fakes: failure policies,
//! no-op redeploys, secret cleanup, verification, cancellation and rollback.

use std::path::PathBuf;
use std::time::Duration;

use fleetgen_core::check::CheckStage;
use fleetgen_core::fakes::{host, FakeBuilder, Harness};
use fleetgen_core::orchestrator::{EXIT_ABORTED, EXIT_PARTIAL_FAILURE, EXIT_SUCCESS};
use fleetgen_core::{
    cancellation, CancelSignal, CheckOptions, DeploymentOutcome, DeploymentPlan, FleetStatus, Host,
    HostResult, RollbackPolicy, SecretRef,
};
use generation_store::{GenerationStatus, HostId};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn id(name: &str) -> HostId {
    HostId::new(name).expect("host id")
}

fn plan(hosts: Vec<Host>, concurrency: usize, policy: RollbackPolicy) -> DeploymentPlan {
    DeploymentPlan::new(hosts, concurrency, policy).expect("plan")
}

async fn deploy(harness: &Harness, hosts: Vec<Host>, policy: RollbackPolicy) -> DeploymentOutcome {
    harness
        .orchestrator
        .run(&plan(hosts, 4, policy), CancelSignal::never())
        .await
}

fn with_secret(mut h: Host, name: &str, source: &str) -> Host {
    h.secrets.push(SecretRef {
        name: name.to_string(),
        source: source.to_string(),
        host: h.id.clone(),
        owner: Some("postgres".to_string()),
        mode: 0o400,
        dest: PathBuf::from(format!("/run/fleetgen-secrets/{name}")),
    });
    h
}

fn leftover_scopes(harness: &Harness) -> usize {
    std::fs::read_dir(harness.secrets_dir())
        .map(|entries| entries.count())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Failure policies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_eval_failure_under_best_effort_leaves_other_hosts_deploying() {
    let harness = Harness::new().unwrap();
    harness.evaluator.fail("host1", "attribute 'nginx' missing");

    let outcome = deploy(
        &harness,
        vec![host("host1"), host("host2")],
        RollbackPolicy::BestEffortContinue,
    )
    .await;

    match outcome.get("host1").unwrap() {
        HostResult::CheckedFailed { stage, diagnostics } => {
            assert_eq!(*stage, CheckStage::Eval);
            assert!(diagnostics.iter().any(|d| d.contains("nginx")));
        }
        other => panic!("expected check failure, got {other:?}"),
    }
    assert!(matches!(
        outcome.get("host2").unwrap(),
        HostResult::Success { generation: 1, changed: true }
    ));
    assert_eq!(harness.builder.builds(&id("host1")), 0);
    assert_eq!(outcome.status(), FleetStatus::PartiallyFailed);
    assert_eq!(outcome.exit_code(), EXIT_PARTIAL_FAILURE);
}

#[tokio::test]
async fn test_abort_policy_skips_hosts_not_yet_started() {
    let harness = Harness::new().unwrap();
    harness.builder.fail("host1", "builder failed with exit code 1", "/nix/store/abc-nginx.drv");
    harness.builder.delay("host1", Duration::from_millis(20));
    harness.builder.delay("host2", Duration::from_millis(100));
    harness.builder.delay("host3", Duration::from_millis(100));

    let hosts = vec![host("host1"), host("host2"), host("host3"), host("host4")];
    let outcome = harness
        .orchestrator
        .run(
            &plan(hosts, 3, RollbackPolicy::AbortFleetOnFirstFailure),
            CancelSignal::never(),
        )
        .await;

    let results: Vec<&HostResult> = outcome.hosts.iter().map(|o| &o.result).collect();
    assert!(matches!(results[0], HostResult::BuildFailed { failed_step, .. } if failed_step.contains("nginx")));
    // already in flight when host1 failed
    assert!(matches!(results[1], HostResult::Success { .. }));
    assert!(matches!(results[2], HostResult::Success { .. }));
    assert!(matches!(results[3], HostResult::Skipped { .. }));

    assert_eq!(harness.evaluator.calls().len(), 3);
    assert!(harness.orchestrator.store().history(&id("host4")).await.unwrap().is_empty());
    assert_eq!(outcome.status(), FleetStatus::Aborted);
    assert_eq!(outcome.exit_code(), EXIT_ABORTED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abort_policy_skips_hosts_not_yet_started_multi_thread() {
    let harness = Harness::new().unwrap();
    harness.builder.fail("host1", "builder failed with exit code 1", "/nix/store/abc-nginx.drv");

    let hosts = vec![host("host1"), host("host2"), host("host3"), host("host4")];
    let outcome = harness
        .orchestrator
        .run(
            &plan(hosts, 1, RollbackPolicy::AbortFleetOnFirstFailure),
            CancelSignal::never(),
        )
        .await;

    assert!(matches!(outcome.hosts[0].result, HostResult::BuildFailed { .. }));
    for skipped in &outcome.hosts[1..] {
        assert!(
            matches!(skipped.result, HostResult::Skipped { .. }),
            "{}: {:?}",
            skipped.host,
            skipped.result
        );
        assert!(harness.orchestrator.store().history(&skipped.host).await.unwrap().is_empty());
    }
    assert_eq!(harness.evaluator.calls(), vec![id("host1")]);
    assert_eq!(outcome.exit_code(), EXIT_ABORTED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hosts_start_in_plan_order_multi_thread() {
    let harness = Harness::new().unwrap();
    let names = ["a", "b", "c", "d", "e", "f"];
    let hosts = names.iter().map(|n| host(n)).collect();

    let outcome = harness
        .orchestrator
        .run(
            &plan(hosts, 1, RollbackPolicy::BestEffortContinue),
            CancelSignal::never(),
        )
        .await;

    assert_eq!(outcome.exit_code(), EXIT_SUCCESS);
    let started: Vec<HostId> = names.iter().map(|n| id(n)).collect();
    assert_eq!(harness.evaluator.calls(), started);
}

#[tokio::test]
async fn test_abort_policy_without_failures_succeeds() {
    let harness = Harness::new().unwrap();
    let outcome = deploy(
        &harness,
        vec![host("a"), host("b"), host("c")],
        RollbackPolicy::AbortFleetOnFirstFailure,
    )
    .await;
    assert!(!outcome.aborted);
    assert_eq!(outcome.exit_code(), EXIT_SUCCESS);
}

#[tokio::test]
async fn test_results_follow_plan_order() {
    let harness = Harness::new().unwrap();
    harness.builder.delay("slow", Duration::from_millis(60));
    let outcome = deploy(
        &harness,
        vec![host("slow"), host("fast")],
        RollbackPolicy::BestEffortContinue,
    )
    .await;
    let order: Vec<&str> = outcome.hosts.iter().map(|o| o.host.as_str()).collect();
    assert_eq!(order, vec!["slow", "fast"]);
}

// ---------------------------------------------------------------------------
// Redeploys
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_redeploy_of_identical_artifact_is_a_no_op() {
    let harness = Harness::new().unwrap();
    let web = id("web1");

    let first = deploy(&harness, vec![host("web1")], RollbackPolicy::BestEffortContinue).await;
    assert!(matches!(
        first.get("web1").unwrap(),
        HostResult::Success { generation: 1, changed: true }
    ));
    let records = harness.log.records(&web).len();

    let second = deploy(&harness, vec![host("web1")], RollbackPolicy::BestEffortContinue).await;
    assert!(matches!(
        second.get("web1").unwrap(),
        HostResult::Success { generation: 1, changed: false }
    ));
    assert_eq!(harness.log.records(&web).len(), records);
    assert_eq!(harness.activator.switch_count(&web), 1);
    assert_eq!(second.exit_code(), EXIT_SUCCESS);
}

#[tokio::test]
async fn test_changed_artifact_supersedes_previous_generation() {
    let harness = Harness::new().unwrap();
    let web = id("web1");

    deploy(&harness, vec![host("web1")], RollbackPolicy::BestEffortContinue).await;
    harness.builder.set_version("web1", "v2");
    let outcome = deploy(&harness, vec![host("web1")], RollbackPolicy::BestEffortContinue).await;

    assert!(matches!(
        outcome.get("web1").unwrap(),
        HostResult::Success { generation: 2, changed: true }
    ));
    let history = harness.orchestrator.store().history(&web).await.unwrap();
    assert_eq!(history[0].status, GenerationStatus::Superseded);
    assert_eq!(history[1].status, GenerationStatus::Active);
    assert_eq!(
        harness.activator.live(&web),
        Some(FakeBuilder::artifact_for(&web, "v2").content_hash)
    );
}

#[tokio::test]
async fn test_failed_activation_keeps_previous_generation_active() {
    let harness = Harness::new().unwrap();
    let web = id("web1");

    deploy(&harness, vec![host("web1")], RollbackPolicy::BestEffortContinue).await;
    harness.builder.set_version("web1", "v2");
    harness.activator.fail_switches_for(&web);
    let outcome = deploy(&harness, vec![host("web1")], RollbackPolicy::BestEffortContinue).await;

    assert!(matches!(
        outcome.get("web1").unwrap(),
        HostResult::ActivationFailed { .. }
    ));
    let active = harness.orchestrator.store().active(&web).await.unwrap().unwrap();
    assert_eq!(active.sequence, 1);
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_secrets_exist_during_activation_only() {
    let harness = Harness::new().unwrap();
    harness.backend.insert("secrets/db.age", b"hunter2");
    let db = with_secret(host("db1"), "db-password", "secrets/db.age");

    let outcome = deploy(&harness, vec![db], RollbackPolicy::BestEffortContinue).await;

    assert!(outcome.get("db1").unwrap().is_success());
    assert_eq!(
        harness.activator.secrets_seen(),
        vec![(id("db1"), "db-password".to_string(), true)]
    );
    assert_eq!(leftover_scopes(&harness), 0);
}

#[tokio::test]
async fn test_secret_failure_blocks_activation_and_cleans_up() {
    let harness = Harness::new().unwrap();
    harness.backend.insert("secrets/tls.age", b"-----BEGIN KEY-----");
    let db = with_secret(
        with_secret(host("db1"), "tls-key", "secrets/tls.age"),
        "db-password",
        "secrets/missing.age",
    );

    let outcome = deploy(&harness, vec![db], RollbackPolicy::BestEffortContinue).await;

    match outcome.get("db1").unwrap() {
        HostResult::SecretsFailed { message } => {
            assert!(message.contains("db-password"), "{message}");
            assert!(!message.contains("BEGIN KEY"));
        }
        other => panic!("expected secrets failure, got {other:?}"),
    }
    assert_eq!(harness.activator.switch_count(&id("db1")), 0);
    assert!(harness.orchestrator.store().history(&id("db1")).await.unwrap().is_empty());
    assert_eq!(leftover_scopes(&harness), 0);
}

#[tokio::test]
async fn test_secrets_removed_after_failed_activation() {
    let harness = Harness::new().unwrap();
    harness.backend.insert("secrets/db.age", b"hunter2");
    harness.activator.fail_switches_for(&id("db1"));
    let db = with_secret(host("db1"), "db-password", "secrets/db.age");

    let outcome = deploy(&harness, vec![db], RollbackPolicy::BestEffortContinue).await;

    assert!(matches!(
        outcome.get("db1").unwrap(),
        HostResult::ActivationFailed { .. }
    ));
    assert_eq!(leftover_scopes(&harness), 0);
}

// ---------------------------------------------------------------------------
// Verification, reachability and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failed_probe_is_unverified_and_does_not_abort() {
    let harness = Harness::new().unwrap();
    harness.probe.mark_unhealthy("web1");
    let mut web = host("web1");
    web.health_url = Some("http://web1:8080/healthz".to_string());

    let outcome = deploy(
        &harness,
        vec![web, host("web2")],
        RollbackPolicy::AbortFleetOnFirstFailure,
    )
    .await;

    match outcome.get("web1").unwrap() {
        HostResult::ActivationSucceededButUnverified { generation, reason } => {
            assert_eq!(*generation, 1);
            assert!(reason.contains("503"));
        }
        other => panic!("expected unverified, got {other:?}"),
    }
    assert!(outcome.get("web2").unwrap().is_success());
    assert!(!outcome.aborted);
    assert_eq!(outcome.exit_code(), EXIT_PARTIAL_FAILURE);
    // the generation stays active; nothing is rolled back automatically
    let active = harness.orchestrator.store().active(&id("web1")).await.unwrap();
    assert_eq!(active.map(|g| g.sequence), Some(1));
}

#[tokio::test]
async fn test_unreachable_host_is_skipped_without_checks() {
    let harness = Harness::new().unwrap();
    let mut edge = host("edge1");
    edge.reachable = false;

    let outcome = deploy(&harness, vec![edge, host("web1")], RollbackPolicy::AbortFleetOnFirstFailure).await;

    assert!(matches!(
        outcome.get("edge1").unwrap(),
        HostResult::Skipped { .. }
    ));
    assert_eq!(harness.evaluator.calls(), vec![id("web1")]);
    assert!(!outcome.aborted);
    assert_eq!(outcome.exit_code(), EXIT_PARTIAL_FAILURE);
}

#[tokio::test]
async fn test_cancel_before_start_touches_nothing() {
    let harness = Harness::new().unwrap();
    let (handle, signal) = cancellation();
    handle.cancel();

    let outcome = harness
        .orchestrator
        .run(
            &plan(vec![host("a"), host("b")], 2, RollbackPolicy::BestEffortContinue),
            signal,
        )
        .await;

    assert!(outcome
        .hosts
        .iter()
        .all(|o| matches!(&o.result, HostResult::Cancelled { stage } if stage == "start")));
    assert!(harness.evaluator.calls().is_empty());
    assert_eq!(outcome.status(), FleetStatus::Cancelled);
    assert_eq!(outcome.exit_code(), EXIT_PARTIAL_FAILURE);
}

#[tokio::test]
async fn test_cancel_during_build_stops_before_activation() {
    let harness = Harness::new().unwrap();
    harness.builder.delay("web1", Duration::from_millis(100));
    let (handle, signal) = cancellation();

    let orchestrator = harness.orchestrator.clone();
    let run = tokio::spawn(async move {
        orchestrator
            .run(&plan(vec![host("web1")], 1, RollbackPolicy::BestEffortContinue), signal)
            .await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.cancel();
    let outcome = run.await.unwrap();

    assert!(matches!(
        outcome.get("web1").unwrap(),
        HostResult::Cancelled { .. }
    ));
    assert_eq!(harness.activator.switch_count(&id("web1")), 0);
    assert!(harness.orchestrator.store().history(&id("web1")).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Rollback and check-only runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_rollback_appends_restoring_generation() {
    let harness = Harness::new().unwrap();
    let web = id("web1");
    let h = host("web1");

    deploy(&harness, vec![h.clone()], RollbackPolicy::BestEffortContinue).await;
    harness.builder.set_version("web1", "v2");
    deploy(&harness, vec![h.clone()], RollbackPolicy::BestEffortContinue).await;

    let outcome = harness
        .orchestrator
        .rollback(&h, 1, Duration::from_secs(5))
        .await;

    assert!(matches!(
        outcome.get("web1").unwrap(),
        HostResult::RolledBack { generation: 3, restored_from: 1 }
    ));
    assert_eq!(outcome.exit_code(), EXIT_SUCCESS);
    assert_eq!(
        harness.activator.live(&web),
        Some(FakeBuilder::artifact_for(&web, "v1").content_hash)
    );
    // no rebuild for a rollback
    assert_eq!(harness.builder.builds(&web), 2);
}

#[tokio::test]
async fn test_rollback_to_unknown_generation_is_refused() {
    let harness = Harness::new().unwrap();
    let h = host("web1");
    deploy(&harness, vec![h.clone()], RollbackPolicy::BestEffortContinue).await;

    let outcome = harness
        .orchestrator
        .rollback(&h, 9, Duration::from_secs(5))
        .await;

    assert!(matches!(
        outcome.get("web1").unwrap(),
        HostResult::RollbackRefused { .. }
    ));
    assert_eq!(outcome.exit_code(), EXIT_PARTIAL_FAILURE);
    let active = harness.orchestrator.store().active(&id("web1")).await.unwrap();
    assert_eq!(active.map(|g| g.sequence), Some(1));
}

#[tokio::test]
async fn test_check_only_reports_every_host_without_building() {
    let harness = Harness::new().unwrap();
    harness.evaluator.fail("b", "infinite recursion encountered");

    let reports = harness
        .orchestrator
        .check(&[host("a"), host("b"), host("c")], &CheckOptions::default(), 2)
        .await;

    let clear: Vec<bool> = reports.iter().map(|r| r.clear_to_build()).collect();
    assert_eq!(clear, vec![true, false, true]);
    assert_eq!(harness.builder.builds(&id("a")), 0);
    assert!(harness.orchestrator.store().hosts().await.unwrap().is_empty());
}
