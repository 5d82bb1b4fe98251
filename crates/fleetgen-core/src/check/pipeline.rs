//! Per-host check pipeline: lint, eval, test.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, instrument};

use crate::adapters::{EvaluatedGraph, Evaluator};
use crate::check::gate::{CheckGate, GateVerdict};
use crate::check::runner::StageRunner;
use crate::check::stage::{CheckOutcome, CheckResult, CheckStage, StageCommand};
use crate::obs;
use crate::registry::Host;

const DIAGNOSTIC_LINES: usize = 20;

/// Everything the pipeline learned about one host.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub host: generation_store::HostId,
    pub results: Vec<CheckResult>,
    /// Present when eval passed
    #[serde(skip)]
    pub graph: Option<EvaluatedGraph>,
    pub verdict: GateVerdict,
}

impl CheckReport {
    pub fn clear_to_build(&self) -> bool {
        self.verdict.passed && self.graph.is_some()
    }

    pub fn result(&self, stage: CheckStage) -> Option<&CheckResult> {
        self.results.iter().find(|r| r.stage == stage)
    }

    /// Diagnostics of the stage that blocked the build, if any.
    pub fn blocking_diagnostics(&self) -> Vec<String> {
        self.verdict
            .blocking_stage
            .and_then(|stage| self.result(stage))
            .map(|r| r.diagnostics.clone())
            .unwrap_or_default()
    }
}

/// Per-invocation knobs for a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOptions {
    pub lint_timeout: Duration,
    pub eval_timeout: Duration,
    pub test_timeout: Duration,
    /// A failing lint blocks the build
    pub strict_lint: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            lint_timeout: Duration::from_secs(120),
            eval_timeout: Duration::from_secs(300),
            test_timeout: Duration::from_secs(600),
            strict_lint: false,
        }
    }
}

pub struct CheckPipeline {
    evaluator: Arc<dyn Evaluator>,
    work_root: PathBuf,
    source_dir: Option<PathBuf>,
}

impl CheckPipeline {
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            evaluator,
            work_root: std::env::temp_dir(),
            source_dir: None,
        }
    }

    /// Parent directory for the per-host test working directories.
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = root.into();
        self
    }

    /// Directory relative command paths (`./tests/x.sh`) are resolved against.
    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = Some(dir.into());
        self
    }

    #[instrument(skip(self, host, options), fields(host = %host.id))]
    pub async fn run(&self, host: &Host, options: &CheckOptions) -> CheckReport {
        let mut results = Vec::with_capacity(3);

        results.push(self.lint(host, options.lint_timeout).await);

        let (eval, graph) = self.eval(host, options.eval_timeout).await;
        let eval_passed = eval.passed();
        results.push(eval);

        let test = if eval_passed {
            self.test(host, options.test_timeout).await
        } else {
            CheckResult::skipped(&host.id, CheckStage::Test, "skipped: eval failed")
        };
        results.push(test);

        for result in &results {
            obs::emit_check_stage(&host.id, result.stage, result.outcome, result.duration_ms);
        }

        let verdict = CheckGate::evaluate(&results, options.strict_lint);
        info!(host = %host.id, clear = verdict.passed, "check pipeline finished");
        CheckReport {
            host: host.id.clone(),
            results,
            graph,
            verdict,
        }
    }

    async fn lint(&self, host: &Host, timeout: Duration) -> CheckResult {
        let Some(command) = &host.lint else {
            return CheckResult::skipped(&host.id, CheckStage::Lint, "no lint command declared");
        };
        let command = StageCommand::new("lint", self.resolve_program(command))
            .with_timeout(timeout)
            .with_env("FLEETGEN_HOST", host.id.as_str());
        let (outcome, diagnostics, duration_ms) = run_command(&command).await;
        CheckResult {
            host: host.id.clone(),
            stage: CheckStage::Lint,
            outcome,
            diagnostics,
            duration_ms,
        }
    }

    async fn eval(&self, host: &Host, timeout: Duration) -> (CheckResult, Option<EvaluatedGraph>) {
        let start = Instant::now();
        let evaluated = tokio::time::timeout(timeout, self.evaluator.evaluate(host)).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (outcome, diagnostics, graph) = match evaluated {
            Ok(Ok(graph)) => (CheckOutcome::Pass, vec![], Some(graph)),
            Ok(Err(e)) => (CheckOutcome::Fail, vec![e.to_string()], None),
            Err(_) => (
                CheckOutcome::Error,
                vec![format!(
                    "evaluation timed out after {} seconds",
                    timeout.as_secs()
                )],
                None,
            ),
        };
        let result = CheckResult {
            host: host.id.clone(),
            stage: CheckStage::Eval,
            outcome,
            diagnostics,
            duration_ms,
        };
        (result, graph)
    }

    async fn test(&self, host: &Host, timeout: Duration) -> CheckResult {
        let start = Instant::now();
        let mut result = CheckResult {
            host: host.id.clone(),
            stage: CheckStage::Test,
            outcome: CheckOutcome::Pass,
            diagnostics: vec![],
            duration_ms: 0,
        };
        if host.tests.is_empty() {
            result.diagnostics.push("no tests declared".to_string());
            return result;
        }

        let workdir = match tempfile::Builder::new()
            .prefix(&format!("fleetgen-test-{}-", host.id))
            .tempdir_in(&self.work_root)
        {
            Ok(dir) => dir,
            Err(e) => {
                result.outcome = CheckOutcome::Error;
                result
                    .diagnostics
                    .push(format!("cannot create test working directory: {e}"));
                return result;
            }
        };

        let mut failed = false;
        let mut errored = false;
        for test in &host.tests {
            let command = StageCommand::new(
                format!("test:{}", test.name),
                self.resolve_program(&test.command),
            )
            .with_timeout(timeout)
            .in_dir(workdir.path())
            .with_env("FLEETGEN_HOST", host.id.as_str());

            let (outcome, diagnostics, _) = run_command(&command).await;
            match outcome {
                CheckOutcome::Fail => failed = true,
                CheckOutcome::Error => errored = true,
                _ => continue,
            }
            result
                .diagnostics
                .extend(diagnostics.into_iter().map(|d| format!("{}: {d}", test.name)));
        }

        result.outcome = if errored {
            CheckOutcome::Error
        } else if failed {
            CheckOutcome::Fail
        } else {
            CheckOutcome::Pass
        };
        result.duration_ms = start.elapsed().as_millis() as u64;
        result
    }

    fn resolve_program(&self, command: &[String]) -> Vec<String> {
        let mut command = command.to_vec();
        if let (Some(base), Some(program)) = (&self.source_dir, command.first_mut()) {
            let path = Path::new(program.as_str());
            if program.contains('/') && path.is_relative() {
                *program = base.join(path).display().to_string();
            }
        }
        command
    }
}

async fn run_command(command: &StageCommand) -> (CheckOutcome, Vec<String>, u64) {
    let start = Instant::now();
    match StageRunner::execute(command).await {
        Ok(result) if result.passed() => (CheckOutcome::Pass, vec![], result.duration_ms),
        Ok(result) => {
            let mut diagnostics = vec![format!("exit code {}", result.exit_code)];
            diagnostics.extend(result.diagnostics(DIAGNOSTIC_LINES));
            (CheckOutcome::Fail, diagnostics, result.duration_ms)
        }
        Err(e) => (
            CheckOutcome::Error,
            vec![e.to_string()],
            start.elapsed().as_millis() as u64,
        ),
    }
}
