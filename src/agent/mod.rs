//! Code-intelligence agent seam: one free-text prompt in, free text out.

pub mod claude;
pub mod contract;
pub mod prompts;
pub mod retry;

use std::path::Path;

use async_trait::async_trait;

use crate::errors::AgentError;

pub use claude::ClaudeCli;
pub use contract::{CommentReview, GateVerdict, IssueAnalysis, extract_json, parse_contract};
pub use retry::RetryPolicy;

#[async_trait]
pub trait CodeAgent: Send + Sync {
    /// Ask a question about the repository at `dir`; the answer is expected
    /// to embed one JSON object. The agent must not modify files.
    async fn ask(&self, prompt: &str, dir: &Path) -> Result<String, AgentError>;

    /// Open-ended mode: the agent edits files under `dir` directly.
    async fn edit(&self, prompt: &str, dir: &Path) -> Result<String, AgentError>;
}
