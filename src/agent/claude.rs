use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use super::CodeAgent;
use crate::errors::AgentError;
use crate::process;

const DEFAULT_CLAUDE_CMD: &str = "claude";

/// Claude Code CLI in print mode. The prompt is sent on stdin.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    claude_cmd: String,
    skip_permissions: bool,
    timeout: Duration,
}

impl Default for ClaudeCli {
    fn default() -> Self {
        Self {
            claude_cmd: DEFAULT_CLAUDE_CMD.to_string(),
            skip_permissions: true,
            timeout: Duration::from_secs(900),
        }
    }
}

impl ClaudeCli {
    pub fn new(claude_cmd: &str, skip_permissions: bool, timeout: Duration) -> Self {
        Self {
            claude_cmd: claude_cmd.to_string(),
            skip_permissions,
            timeout,
        }
    }

    fn args(&self) -> Vec<&'static str> {
        let mut args = vec!["--print", "--output-format", "text"];
        if self.skip_permissions {
            args.push("--dangerously-skip-permissions");
        }
        args
    }

    async fn invoke(&self, prompt: &str, dir: &Path) -> Result<String, AgentError> {
        let started = std::time::Instant::now();
        let out = process::run_with_input(
            &self.claude_cmd,
            &self.args(),
            dir,
            Some(prompt),
            self.timeout,
        )
        .await?;
        tracing::debug!(
            elapsed_secs = started.elapsed().as_secs(),
            bytes = out.stdout.len(),
            "Agent response received"
        );
        Ok(out.stdout)
    }
}

#[async_trait]
impl CodeAgent for ClaudeCli {
    async fn ask(&self, prompt: &str, dir: &Path) -> Result<String, AgentError> {
        self.invoke(prompt, dir).await
    }

    async fn edit(&self, prompt: &str, dir: &Path) -> Result<String, AgentError> {
        self.invoke(prompt, dir).await
    }
}
