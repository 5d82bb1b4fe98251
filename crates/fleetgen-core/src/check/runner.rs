//! Stage command execution.

use std::process::Stdio;
use std::time::Instant;

use tokio::process::Command;

use crate::check::stage::StageCommand;

/// Result of a stage command execution.
#[derive(Debug, Clone)]
pub struct StageResult {
    /// Stage name.
    pub stage_name: String,

    /// Exit code (0 = success).
    pub exit_code: i32,

    pub stdout: String,

    pub stderr: String,

    pub duration_ms: u64,

    pub success: bool,
}

impl StageResult {
    /// Whether this stage passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// The last few meaningful output lines, stderr first.
    pub fn diagnostics(&self, max_lines: usize) -> Vec<String> {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<String> = source
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();
        let skip = lines.len().saturating_sub(max_lines);
        lines.into_iter().skip(skip).collect()
    }
}

/// Runs a single stage command to completion or timeout.
pub struct StageRunner;

impl StageRunner {
    /// Execute a stage command.
    ///
    /// Returns `Err` when the command cannot run at all (empty, spawn
    /// failure, timeout); a non-zero exit is a normal `StageResult`.
    pub async fn execute(config: &StageCommand) -> anyhow::Result<StageResult> {
        let start = Instant::now();

        let Some((exe, args)) = config.command.split_first() else {
            anyhow::bail!("Stage {} has empty command", config.name);
        };

        let mut cmd = Command::new(exe);
        cmd.args(args)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("Stage {} failed to start {}: {}", config.name, exe, e))?;

        let output = match config.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    anyhow::anyhow!(
                        "Stage {} timed out after {} seconds",
                        config.name,
                        limit.as_secs()
                    )
                })??,
            None => child.wait_with_output().await?,
        };

        let duration_ms = start.elapsed().as_millis() as u64;

        Ok(StageResult {
            stage_name: config.name.clone(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms,
            success: output.status.success(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stage_result_passed() {
        let result = StageResult {
            stage_name: "lint".to_string(),
            exit_code: 0,
            stdout: "".to_string(),
            stderr: "".to_string(),
            duration_ms: 100,
            success: true,
        };
        assert!(result.passed());
    }

    #[test]
    fn test_diagnostics_prefer_stderr_tail() {
        let result = StageResult {
            stage_name: "test:smoke".to_string(),
            exit_code: 1,
            stdout: "noise\n".to_string(),
            stderr: "one\n\ntwo\nthree\n".to_string(),
            duration_ms: 1,
            success: false,
        };
        assert_eq!(result.diagnostics(2), vec!["two", "three"]);
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let config = StageCommand::new("echo_test", vec!["echo".to_string(), "hello".to_string()]);
        let result = StageRunner::execute(&config).await.expect("execute failed");
        assert!(result.passed());
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let config = StageCommand::new("false_test", vec!["false".to_string()]);
        let result = StageRunner::execute(&config).await.expect("execute failed");
        assert!(!result.success);
        assert_ne!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_env_and_working_dir_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let config = StageCommand::new(
            "env_test",
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo $FLEETGEN_HOST; pwd".to_string(),
            ],
        )
        .with_env("FLEETGEN_HOST", "web1")
        .in_dir(dir.path());

        let result = StageRunner::execute(&config).await.unwrap();
        let lines: Vec<&str> = result.stdout.lines().collect();
        assert_eq!(lines[0], "web1");
        let pwd = std::fs::canonicalize(lines[1]).unwrap();
        assert_eq!(pwd, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn test_timeout_is_error() {
        let config = StageCommand::new("sleepy", vec!["sleep".to_string(), "5".to_string()])
            .with_timeout(Duration::from_millis(50));
        let err = StageRunner::execute(&config).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_empty_command_is_error() {
        let config = StageCommand::new("empty", vec![]);
        assert!(StageRunner::execute(&config).await.is_err());
    }
}
