//! Error types for nix-fleet-adapter

use thiserror::Error;

/// Errors that can occur while driving Nix
#[derive(Error, Debug)]
pub enum NixError {
    /// Program not found on PATH
    #[error("{program} is not installed or not in PATH")]
    ProgramNotFound { program: String },

    /// A command exited unsuccessfully
    #[error("`{command}` exited with code {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Evaluation of a configuration failed
    #[error("evaluation failed: {message}")]
    EvalFailed {
        message: String,
        location: Option<String>,
    },

    /// Realising a derivation failed
    #[error("build failed at {failed_step}: {message}")]
    BuildFailed {
        message: String,
        failed_step: String,
    },

    /// A step of the host switch failed
    #[error("switch step '{step}' failed: {message}")]
    SwitchFailed { step: String, message: String },

    /// Nix printed something we could not interpret
    #[error("unexpected nix output: {0}")]
    UnexpectedOutput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}
