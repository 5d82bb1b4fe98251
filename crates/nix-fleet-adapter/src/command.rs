//! Process plumbing for the `nix`, `ssh` and host-side commands

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::NixError;
use crate::Result;

/// Captured output of a successful command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Last non-empty stdout line, trimmed.
    pub fn last_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
    }
}

/// Handle on the `nix` binary plus the flags passed to every invocation.
#[derive(Debug, Clone)]
pub struct NixCli {
    program: String,
    common_args: Vec<String>,
}

impl Default for NixCli {
    fn default() -> Self {
        Self {
            program: "nix".to_string(),
            common_args: vec![
                "--extra-experimental-features".to_string(),
                "nix-command flakes".to_string(),
            ],
        }
    }
}

impl NixCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// `nix --version`
    pub async fn version(&self) -> Result<String> {
        let out = run(&self.program, &["--version".to_string()], None).await?;
        Ok(out.stdout.trim().to_string())
    }

    /// Run `nix <common args> <args>`.
    pub async fn run(&self, args: &[String]) -> Result<CommandOutput> {
        let mut full = self.common_args.clone();
        full.extend(args.iter().cloned());
        run(&self.program, &full, None).await
    }
}

/// Run `program args...`, feeding `stdin` if given, and fail on non-zero exit.
pub async fn run(program: &str, args: &[String], stdin: Option<&[u8]>) -> Result<CommandOutput> {
    let rendered = render(program, args);
    debug!(command = %rendered, "running");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => NixError::ProgramNotFound {
            program: program.to_string(),
        },
        _ => NixError::Io(e),
    })?;

    if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(bytes).await?;
        pipe.shutdown().await?;
    }

    let output = child.wait_with_output().await?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(NixError::CommandFailed {
            command: rendered,
            code: output.status.code(),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(CommandOutput { stdout, stderr })
}

/// Human-readable command line for logs and errors.
pub fn render(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        if arg.contains(char::is_whitespace) || arg.is_empty() {
            line.push('\'');
            line.push_str(arg);
            line.push('\'');
        } else {
            line.push_str(arg);
        }
    }
    line
}
