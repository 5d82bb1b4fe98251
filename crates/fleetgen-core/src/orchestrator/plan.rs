//! Deployment plans: what to deploy, how wide, and what to do on failure.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::check::CheckOptions;
use crate::error::ConfigError;
use crate::registry::Host;

/// Fleet failure policy, decided once per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackPolicy {
    /// First check/build/secret/activation failure stops scheduling new hosts.
    AbortFleetOnFirstFailure,
    /// Every host runs to its own conclusion.
    BestEffortContinue,
}

impl RollbackPolicy {
    pub fn aborts_on_failure(&self) -> bool {
        matches!(self, RollbackPolicy::AbortFleetOnFirstFailure)
    }
}

impl FromStr for RollbackPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abort" | "abort-fleet-on-first-failure" => Ok(RollbackPolicy::AbortFleetOnFirstFailure),
            "continue" | "best-effort" | "best-effort-continue" => {
                Ok(RollbackPolicy::BestEffortContinue)
            }
            other => Err(ConfigError::InvalidValue {
                key: "policy".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Upper bounds for each suspending stage. Activation is never bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimeouts {
    pub lint: Duration,
    pub eval: Duration,
    pub test: Duration,
    pub build: Duration,
    pub secrets: Duration,
    pub probe: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            lint: Duration::from_secs(120),
            eval: Duration::from_secs(300),
            test: Duration::from_secs(600),
            build: Duration::from_secs(3600),
            secrets: Duration::from_secs(60),
            probe: Duration::from_secs(30),
        }
    }
}

/// An immutable description of one deployment invocation.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    hosts: Vec<Host>,
    concurrency: usize,
    policy: RollbackPolicy,
    timeouts: StageTimeouts,
    strict_lint: bool,
}

impl DeploymentPlan {
    /// `concurrency` above the host count is clamped to it; zero is an error.
    pub fn new(
        hosts: Vec<Host>,
        concurrency: usize,
        policy: RollbackPolicy,
    ) -> Result<Self, ConfigError> {
        if concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "concurrency".to_string(),
                value: concurrency.to_string(),
            });
        }
        let concurrency = concurrency.min(hosts.len().max(1));
        Ok(Self {
            hosts,
            concurrency,
            policy,
            timeouts: StageTimeouts::default(),
            strict_lint: false,
        })
    }

    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_strict_lint(mut self, strict: bool) -> Self {
        self.strict_lint = strict;
        self
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn policy(&self) -> RollbackPolicy {
        self.policy
    }

    pub fn timeouts(&self) -> &StageTimeouts {
        &self.timeouts
    }

    pub fn strict_lint(&self) -> bool {
        self.strict_lint
    }

    pub fn check_options(&self) -> CheckOptions {
        CheckOptions {
            lint_timeout: self.timeouts.lint,
            eval_timeout: self.timeouts.eval,
            test_timeout: self.timeouts.test,
            strict_lint: self.strict_lint,
        }
    }
}
