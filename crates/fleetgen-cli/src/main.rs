//! fleetgen - generation-based deployment for a fleet of hosts
//!
//! ## Commands
//!
//! - `check`: lint, evaluate and test host configurations without building
//! - `deploy`: build and atomically switch hosts to a new generation
//! - `rollback`: re-activate an earlier generation without rebuilding
//! - `status`: show the generation history of hosts
//!
//! Exit codes: 0 success, 1 partial failure, 2 fleet aborted,
//! 3 invalid invocation or configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleetgen_core::adapters::nix::{NixActivator, NixBuilder, NixEvaluator};
use fleetgen_core::check::CheckOutcome;
use fleetgen_core::orchestrator::{EXIT_INVALID, EXIT_PARTIAL_FAILURE, EXIT_SUCCESS};
use fleetgen_core::{
    cancellation, init_tracing, CheckOptions, CheckPipeline, CheckReport, CommandSecretBackend,
    ConfigError, DeploymentOutcome, DeploymentPlan, FleetConfig, FleetStatus, HostRegistry,
    HttpHealthProbe, Orchestrator, RollbackPolicy, SecretResolver,
};
use generation_store::{FsGenerationLog, Generation, GenerationStore};
use nix_fleet_adapter::{NixCli, Switcher};
use serde::Serialize;
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "fleetgen")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Generation-based deployment orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output and JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Fleet registry file
    #[arg(long, global = true, env = "FLEETGEN_REGISTRY")]
    registry: Option<PathBuf>,

    /// Directory holding the generation logs
    #[arg(long, global = true, env = "FLEETGEN_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run lint, eval and test stages without building
    Check {
        /// Hosts to check (default: the whole fleet)
        hosts: Vec<String>,

        /// Maximum hosts checked at once
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Treat lint failures as blocking
        #[arg(long)]
        strict_lint: bool,
    },

    /// Build and activate new generations
    Deploy {
        /// Hosts to deploy (default: the whole fleet)
        hosts: Vec<String>,

        /// Failure policy: `abort` stops scheduling hosts after the first failure
        #[arg(long, default_value = "abort")]
        policy: RollbackPolicy,

        /// Maximum hosts deployed at once
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Treat lint failures as blocking
        #[arg(long)]
        strict_lint: bool,
    },

    /// Re-activate an earlier generation of one host
    Rollback {
        host: String,

        /// Generation sequence number to restore
        generation: u64,
    },

    /// Show generation history
    Status {
        /// Host to show (default: every registered host)
        host: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_INVALID } else { EXIT_SUCCESS };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

/// Configuration problems exit 3; anything else that stops the run exits 1.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.chain().any(|cause| cause.is::<ConfigError>()) {
        EXIT_INVALID
    } else {
        EXIT_PARTIAL_FAILURE
    }
}

async fn execute(cli: Cli) -> Result<i32> {
    let mut config = FleetConfig::from_env()?;
    if let Some(registry) = cli.registry {
        config.registry_path = registry;
    }
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }
    let json = cli.json;

    match cli.command {
        Commands::Check {
            hosts,
            concurrency,
            strict_lint,
        } => {
            if let Some(n) = concurrency {
                config.concurrency = n;
            }
            config.strict_lint |= strict_lint;
            cmd_check(&config, &hosts, json).await
        }
        Commands::Deploy {
            hosts,
            policy,
            concurrency,
            strict_lint,
        } => {
            if let Some(n) = concurrency {
                config.concurrency = n;
            }
            config.strict_lint |= strict_lint;
            cmd_deploy(&config, &hosts, policy, json).await
        }
        Commands::Rollback { host, generation } => {
            cmd_rollback(&config, &host, generation, json).await
        }
        Commands::Status { host } => cmd_status(&config, host.as_deref(), json).await,
    }
}

// ========== Wiring ==========

struct Fleet {
    registry: HostRegistry,
    orchestrator: Orchestrator,
}

/// Directory relative secret locators and test scripts resolve against.
fn source_dir(registry_path: &Path) -> PathBuf {
    match registry_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// The log keeps its files under `<state_dir>/generations/`.
fn open_log(state_dir: &Path) -> Result<FsGenerationLog> {
    FsGenerationLog::new(state_dir)
        .with_context(|| format!("failed to open generation log in {}", state_dir.display()))
}

fn open_fleet(config: &FleetConfig) -> Result<Fleet> {
    let registry = HostRegistry::load(&config.registry_path)?;
    let source_dir = source_dir(&config.registry_path);

    let log = open_log(&config.state_dir)?;
    let nix = NixCli::default();
    let activator = NixActivator::new(Switcher::new(nix.clone()), registry.hosts());
    let store = Arc::new(GenerationStore::new(Arc::new(log), Arc::new(activator)));

    let backend = CommandSecretBackend::new(&config.decrypt_command)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: "FLEETGEN_DECRYPT_COMMAND".to_string(),
            value: String::new(),
        })?
        .with_base_dir(&source_dir);
    let probe = HttpHealthProbe::new(config.timeouts.probe).context("failed to build health probe")?;

    let pipeline =
        CheckPipeline::new(Arc::new(NixEvaluator::new(nix.clone()))).with_source_dir(source_dir);
    let orchestrator = Orchestrator::new(
        store,
        pipeline,
        Arc::new(NixBuilder::new(nix)),
        SecretResolver::new(Arc::new(backend)),
        Arc::new(probe),
        &config.secrets_dir,
    );

    Ok(Fleet {
        registry,
        orchestrator,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ========== Commands ==========

async fn cmd_check(config: &FleetConfig, ids: &[String], json: bool) -> Result<i32> {
    let fleet = open_fleet(config)?;
    let hosts = fleet.registry.select(ids)?;
    let options = CheckOptions {
        lint_timeout: config.timeouts.lint,
        eval_timeout: config.timeouts.eval,
        test_timeout: config.timeouts.test,
        strict_lint: config.strict_lint,
    };

    let reports = fleet
        .orchestrator
        .check(&hosts, &options, config.concurrency)
        .await;
    let clear = reports.iter().filter(|r| r.clear_to_build()).count();

    if json {
        print_json(&reports)?;
    } else {
        for report in &reports {
            print_check_report(report);
        }
        println!();
        println!("Summary: {}/{} hosts clear to build", clear, reports.len());
    }

    Ok(if clear == reports.len() {
        EXIT_SUCCESS
    } else {
        EXIT_PARTIAL_FAILURE
    })
}

fn print_check_report(report: &CheckReport) {
    let mark = if report.clear_to_build() { "✓" } else { "✗" };
    println!("{} {}", mark, report.host);
    for result in &report.results {
        let outcome = match result.outcome {
            CheckOutcome::Pass => "pass",
            CheckOutcome::Fail => "fail",
            CheckOutcome::Error => "error",
            CheckOutcome::Skipped => "skipped",
        };
        println!("    {:<5} {} ({}ms)", result.stage, outcome, result.duration_ms);
        if !result.passed() && result.outcome != CheckOutcome::Skipped {
            for line in &result.diagnostics {
                println!("          {}", line);
            }
        }
    }
}

async fn cmd_deploy(
    config: &FleetConfig,
    ids: &[String],
    policy: RollbackPolicy,
    json: bool,
) -> Result<i32> {
    let fleet = open_fleet(config)?;
    let hosts = fleet.registry.select(ids)?;
    let plan = DeploymentPlan::new(hosts, config.concurrency, policy)?
        .with_timeouts(config.timeouts)
        .with_strict_lint(config.strict_lint);

    let (handle, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after current stages");
            handle.cancel();
        }
    });

    let outcome = fleet.orchestrator.run(&plan, signal).await;
    print_outcome(&outcome, json)?;
    Ok(outcome.exit_code())
}

async fn cmd_rollback(config: &FleetConfig, id: &str, generation: u64, json: bool) -> Result<i32> {
    let fleet = open_fleet(config)?;
    let host = fleet
        .registry
        .get(id)
        .ok_or_else(|| ConfigError::UnknownHost { id: id.to_string() })?;

    info!(host = %host.id, generation, "rolling back");
    let outcome = fleet
        .orchestrator
        .rollback(host, generation, config.timeouts.secrets)
        .await;
    print_outcome(&outcome, json)?;
    Ok(outcome.exit_code())
}

fn print_outcome(outcome: &DeploymentOutcome, json: bool) -> Result<()> {
    if json {
        return print_json(outcome);
    }
    for host in &outcome.hosts {
        let mark = if host.result.is_success() { "✓" } else { "✗" };
        println!("  {} {} {} ({}ms)", mark, host.host, host.result, host.duration_ms);
    }
    let status = match outcome.status() {
        FleetStatus::Succeeded => "succeeded",
        FleetStatus::PartiallyFailed => "partially failed",
        FleetStatus::Aborted => "aborted",
        FleetStatus::Cancelled => "cancelled",
    };
    println!();
    println!("Run {}: {}", outcome.run_id, status);
    Ok(())
}

#[derive(Serialize)]
struct HostStatus {
    host: String,
    active: Option<u64>,
    generations: Vec<Generation>,
}

async fn cmd_status(config: &FleetConfig, id: Option<&str>, json: bool) -> Result<i32> {
    let fleet = open_fleet(config)?;
    let hosts = match id {
        Some(id) => fleet.registry.select(&[id.to_string()])?,
        None => fleet.registry.hosts().to_vec(),
    };

    let store = fleet.orchestrator.store();
    let mut statuses = Vec::with_capacity(hosts.len());
    for host in &hosts {
        let generations = store
            .history(&host.id)
            .await
            .with_context(|| format!("failed to read history for {}", host.id))?;
        let active = store.active(&host.id).await?.map(|g| g.sequence);
        statuses.push(HostStatus {
            host: host.id.to_string(),
            active,
            generations,
        });
    }

    if json {
        print_json(&statuses)?;
        return Ok(EXIT_SUCCESS);
    }

    for status in &statuses {
        match status.active {
            Some(seq) => println!("{}: generation {} active", status.host, seq),
            None => println!("{}: no active generation", status.host),
        }
        for generation in status.generations.iter().rev() {
            let restored = generation
                .restored_from
                .map(|from| format!(" (restored from {})", from))
                .unwrap_or_default();
            println!(
                "    {:>4} {:<12} {} {}{}",
                generation.sequence,
                generation.status.as_str(),
                generation.recorded_at.to_rfc3339(),
                generation.content_hash.short(),
                restored
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
