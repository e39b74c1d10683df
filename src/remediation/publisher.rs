//! Change Request Publisher: opens a new request or updates the reused one,
//! and produces the terminal ledger record for the issue.

use std::path::Path;

use anyhow::{Context, Result};

use crate::agent::IssueAnalysis;
use crate::hosting::{BOT_COMMENT_PREFIX, ChangeRequest, ChangeRequestClient, NewChangeRequest};
use crate::ledger::{IssueOutcome, IssueStatus};
use crate::remediation::patch::AppliedFix;
use crate::tracker::Issue;

const TITLE_ROOT_CAUSE_CHARS: usize = 60;

pub fn change_request_title(analysis: &IssueAnalysis) -> String {
    let first_line = analysis.root_cause.lines().next().unwrap_or("").trim();
    let summary: String = first_line.chars().take(TITLE_ROOT_CAUSE_CHARS).collect();
    if summary.is_empty() {
        "Fix: automated fix".to_string()
    } else {
        format!("Fix: {}", summary)
    }
}

pub fn change_request_body(
    module: &str,
    issue: &Issue,
    analysis: &IssueAnalysis,
    applied: &AppliedFix,
) -> String {
    let files = applied
        .files
        .iter()
        .map(|f| format!("- `{}`", f.display()))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "## Automated fix\n\n\
         **Issue:** {title}\n\
         **Reference:** {reference}\n\
         **Module:** {module}\n\
         **Events (24h):** {count}\n\n\
         ## Root cause\n\n{root_cause}\n\n\
         ## Fix\n\n{fix}\n\n\
         ## Files changed\n\n{files}\n\n\
         **Confidence:** {confidence} | **Fix type:** {fix_type}\n\n\
         ---\n\
         This change was generated automatically. Please review carefully before merging; \
         comments on this pull request are picked up and addressed.",
        title = issue.title,
        reference = issue.reference(),
        module = module,
        count = issue.count,
        root_cause = analysis.root_cause,
        fix = analysis.fix,
        files = files,
        confidence = analysis.confidence.as_str(),
        fix_type = analysis.fix_type.as_str(),
    )
}

pub fn revision_comment(issue: &Issue, analysis: &IssueAnalysis, applied: &AppliedFix) -> String {
    format!(
        "{} updated this pull request for {}.\n\n**Root cause:** {}\n\n**Fix:** {}\n\nThe branch was reset to the trunk tip and now carries commit `{}`.",
        BOT_COMMENT_PREFIX,
        issue.reference(),
        analysis.root_cause,
        analysis.fix,
        applied.commit
    )
}

/// Everything the publisher needs about one pushed fix.
pub struct Publication<'a> {
    pub module: &'a str,
    pub repo: &'a Path,
    pub trunk: &'a str,
    pub issue: &'a Issue,
    pub analysis: &'a IssueAnalysis,
    pub applied: &'a AppliedFix,
}

/// Publish the pushed fix. A new fix opens a change request (`success`); a
/// revision of an open duplicate comments on it (`updated`).
pub async fn publish(
    hosting: &dyn ChangeRequestClient,
    publication: &Publication<'_>,
    existing: Option<&ChangeRequest>,
) -> Result<IssueOutcome> {
    let Publication {
        module,
        repo,
        trunk,
        issue,
        analysis,
        applied,
    } = *publication;

    match existing {
        Some(cr) => {
            // The force-push already updated the request; the comment is a courtesy.
            let comment = revision_comment(issue, analysis, applied);
            if let Err(e) = hosting.post_comment(repo, cr.number, &comment).await {
                tracing::warn!(change_request = cr.number, error = %format!("{:#}", e), "Could not comment on updated change request");
            }
            tracing::info!(url = %cr.url, "Updated existing change request");
            Ok(
                IssueOutcome::new(&issue.id, module, &issue.title, IssueStatus::Updated)
                    .with_change_request(&cr.url),
            )
        }
        None => {
            let request = NewChangeRequest {
                title: change_request_title(analysis),
                body: change_request_body(module, issue, analysis, applied),
                base: trunk.to_string(),
                head: applied.branch.clone(),
                draft: false,
            };
            let url = hosting
                .create_change_request(repo, &request)
                .await
                .context("Failed to open change request")?;
            tracing::info!(url = %url, "Opened change request");
            Ok(IssueOutcome::new(&issue.id, module, &issue.title, IssueStatus::Success)
                .with_change_request(url))
        }
    }
}
