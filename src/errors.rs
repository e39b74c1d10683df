//! Typed error hierarchy for the autofix orchestrator.
//!
//! Most plumbing uses `anyhow` with context. The enums here exist where a
//! caller has to branch on the kind of failure:
//! - `CommandError`: subprocess execution (git, gh, agent CLI)
//! - `AgentError`: code-intelligence agent calls; timeouts are retried
//! - `PatchError`: exact-substring patch application; any variant aborts the fix

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from running an external command with a deadline.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {}s", .timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },

    #[error("`{command}` exited with status {status:?}: {stderr}")]
    Failed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
}

impl CommandError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::TimedOut { .. })
    }
}

/// Errors from the code-intelligence agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent timed out after {}s", .timeout.as_secs())]
    Timeout { timeout: Duration },

    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Agent exited with status {exit_code:?}: {stderr}")]
    NonZeroExit {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Agent response did not contain a JSON object")]
    NoStructuredOutput,

    #[error("Agent response did not match the expected contract: {0}")]
    ContractViolation(#[source] serde_json::Error),
}

impl AgentError {
    /// A deadline hit by this process, or an agent exit whose stderr reports
    /// an upstream timeout (the CLI surfaces API timeouts that way).
    pub fn is_timeout(&self) -> bool {
        match self {
            AgentError::Timeout { .. } => true,
            AgentError::NonZeroExit { stderr, .. } => mentions_timeout(stderr),
            _ => false,
        }
    }
}

fn mentions_timeout(text: &str) -> bool {
    let text = text.to_lowercase();
    text.contains("timed out") || text.contains("timeout") || text.contains("etimedout")
}

impl From<CommandError> for AgentError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Spawn { source, .. } => AgentError::SpawnFailed(source),
            CommandError::TimedOut { timeout, .. } => AgentError::Timeout { timeout },
            CommandError::Failed { status, stderr, .. } => AgentError::NonZeroExit {
                exit_code: status,
                stderr,
            },
        }
    }
}

/// Errors from applying an exact-substring fix to the working copy.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Fix contains no file changes")]
    EmptyFix,

    #[error("File not found: {}", .path.display())]
    FileNotFound { path: PathBuf },

    #[error("Path {path} escapes the repository")]
    PathEscapesRepository { path: String },

    #[error("Could not find exact code to replace in {path}")]
    OldTextNotFound { path: String },

    #[error("Unsupported change type '{kind}' in {path}")]
    UnsupportedChange { path: String, kind: String },

    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
