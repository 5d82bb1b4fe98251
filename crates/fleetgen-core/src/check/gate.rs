//! Clear-to-build evaluation over a host's check results.

use serde::{Deserialize, Serialize};

use crate::check::stage::{CheckOutcome, CheckResult, CheckStage};

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateVerdict {
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// First stage that blocked, in stage order.
    pub blocking_stage: Option<CheckStage>,

    pub message: String,
}

/// Gate rules for the check pipeline.
pub struct CheckGate;

impl CheckGate {
    /// Evaluate whether a host is clear to build.
    ///
    /// Gate rule:
    /// - eval must pass
    /// - test must pass
    /// - lint is advisory unless `strict_lint`, then a failing lint blocks
    pub fn evaluate(results: &[CheckResult], strict_lint: bool) -> GateVerdict {
        let mut violations = Vec::new();
        let mut blocking_stage = None;
        let mut block = |stage: CheckStage, violation: String| {
            blocking_stage.get_or_insert(stage);
            violations.push(violation);
        };

        let find = |stage: CheckStage| results.iter().find(|r| r.stage == stage);

        if strict_lint {
            if let Some(lint) = find(CheckStage::Lint) {
                if matches!(lint.outcome, CheckOutcome::Fail | CheckOutcome::Error) {
                    block(
                        CheckStage::Lint,
                        format!("Stage 'lint' {} (strict)", describe(lint.outcome)),
                    );
                }
            }
        }

        for stage in [CheckStage::Eval, CheckStage::Test] {
            match find(stage) {
                Some(result) if result.passed() => {}
                Some(result) => block(
                    stage,
                    format!("Stage '{}' {}", stage, describe(result.outcome)),
                ),
                None => block(stage, format!("Stage '{stage}' never ran")),
            }
        }

        let passed = violations.is_empty();
        let message = if passed {
            "Clear to build".to_string()
        } else {
            format!("Gate failed with {} violation(s)", violations.len())
        };

        GateVerdict {
            passed,
            violations,
            blocking_stage,
            message,
        }
    }
}

fn describe(outcome: CheckOutcome) -> &'static str {
    match outcome {
        CheckOutcome::Pass => "passed",
        CheckOutcome::Fail => "failed",
        CheckOutcome::Error => "errored",
        CheckOutcome::Skipped => "was skipped",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use generation_store::HostId;

    fn result(stage: CheckStage, outcome: CheckOutcome) -> CheckResult {
        CheckResult {
            host: HostId::new("web1").unwrap(),
            stage,
            outcome,
            diagnostics: vec![],
            duration_ms: 0,
        }
    }

    #[test]
    fn test_all_pass() {
        let results = vec![
            result(CheckStage::Lint, CheckOutcome::Skipped),
            result(CheckStage::Eval, CheckOutcome::Pass),
            result(CheckStage::Test, CheckOutcome::Pass),
        ];
        let verdict = CheckGate::evaluate(&results, true);
        assert!(verdict.passed);
        assert!(verdict.blocking_stage.is_none());
    }

    #[test]
    fn test_eval_failure_blocks_at_eval() {
        let results = vec![
            result(CheckStage::Lint, CheckOutcome::Pass),
            result(CheckStage::Eval, CheckOutcome::Fail),
            result(CheckStage::Test, CheckOutcome::Skipped),
        ];
        let verdict = CheckGate::evaluate(&results, false);
        assert!(!verdict.passed);
        assert_eq!(verdict.blocking_stage, Some(CheckStage::Eval));
        assert_eq!(verdict.violations.len(), 2);
    }

    #[test]
    fn test_lint_is_advisory_unless_strict() {
        let results = vec![
            result(CheckStage::Lint, CheckOutcome::Fail),
            result(CheckStage::Eval, CheckOutcome::Pass),
            result(CheckStage::Test, CheckOutcome::Pass),
        ];
        assert!(CheckGate::evaluate(&results, false).passed);

        let strict = CheckGate::evaluate(&results, true);
        assert!(!strict.passed);
        assert_eq!(strict.blocking_stage, Some(CheckStage::Lint));
    }

    #[test]
    fn test_missing_stage_blocks() {
        let results = vec![result(CheckStage::Eval, CheckOutcome::Pass)];
        let verdict = CheckGate::evaluate(&results, false);
        assert_eq!(verdict.blocking_stage, Some(CheckStage::Test));
        assert!(verdict.violations[0].contains("never ran"));
    }
}
