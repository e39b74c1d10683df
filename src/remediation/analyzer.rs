//! Fix Analyzer: one timeout-retried agent call, strict contract parsing,
//! and the acceptance gate.

use crate::agent::contract::{GateVerdict, IssueAnalysis, parse_contract};
use crate::agent::{CodeAgent, RetryPolicy, prompts};
use crate::errors::AgentError;
use crate::remediation::context::AnalysisContext;

#[derive(Debug, Clone)]
pub enum AnalysisVerdict {
    Accepted(IssueAnalysis),
    Rejected { reason: String },
}

/// Ask the agent for a root cause and patch. Unparsable output is an error,
/// not a rejection.
pub async fn analyze(
    agent: &dyn CodeAgent,
    retry: &RetryPolicy,
    ctx: &AnalysisContext,
) -> Result<AnalysisVerdict, AgentError> {
    let prompt = prompts::analysis_prompt(ctx);
    let prompt = prompt.as_str();
    let dir = ctx.repo_path.as_path();

    let response = retry
        .retry_on_timeout("analysis", move || agent.ask(prompt, dir))
        .await?;
    let analysis: IssueAnalysis = parse_contract(&response)?;

    tracing::info!(
        can_fix = analysis.can_fix,
        confidence = analysis.confidence.as_str(),
        fix_type = analysis.fix_type.as_str(),
        files = analysis.fix_files.len(),
        "Analysis received"
    );

    Ok(match analysis.gate() {
        GateVerdict::Accept => AnalysisVerdict::Accepted(analysis),
        GateVerdict::Reject { reason } => AnalysisVerdict::Rejected { reason },
    })
}
