//! Check stage definitions and per-stage results.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use generation_store::HostId;
use serde::{Deserialize, Serialize};

/// Fixed check stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CheckStage {
    /// Host-declared lint command
    Lint,

    /// Configuration evaluation without building
    Eval,

    /// Host-declared test commands
    Test,
}

impl CheckStage {
    pub fn name(&self) -> &'static str {
        match self {
            CheckStage::Lint => "lint",
            CheckStage::Eval => "eval",
            CheckStage::Test => "test",
        }
    }
}

impl std::fmt::Display for CheckStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Pass,
    /// The stage ran and reported a problem
    Fail,
    /// The stage could not run (spawn failure, timeout)
    Error,
    Skipped,
}

/// Outcome of one stage for one host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckResult {
    pub host: HostId,
    pub stage: CheckStage,
    pub outcome: CheckOutcome,
    pub diagnostics: Vec<String>,
    pub duration_ms: u64,
}

impl CheckResult {
    pub fn passed(&self) -> bool {
        self.outcome == CheckOutcome::Pass
    }

    pub fn skipped(host: &HostId, stage: CheckStage, reason: impl Into<String>) -> Self {
        Self {
            host: host.clone(),
            stage,
            outcome: CheckOutcome::Skipped,
            diagnostics: vec![reason.into()],
            duration_ms: 0,
        }
    }
}

/// A command run by the lint or test stage.
#[derive(Debug, Clone)]
pub struct StageCommand {
    /// Human-readable name, e.g. `test:smoke`.
    pub name: String,

    /// Command to execute (first element is executable).
    pub command: Vec<String>,

    pub timeout: Option<Duration>,

    pub working_dir: Option<PathBuf>,

    pub env: BTreeMap<String, String>,
}

impl StageCommand {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
            timeout: None,
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}
