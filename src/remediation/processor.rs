//! Per-issue pipeline: ledger lookup, lock, context, analysis, duplicate
//! search, patch, publish, ledger update.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::Instrument;

use crate::config::ProjectConfig;
use crate::errors::PatchError;
use crate::ledger::{IssueOutcome, IssueStatus, LookupOutcome};
use crate::remediation::analyzer::{self, AnalysisVerdict};
use crate::remediation::context;
use crate::remediation::duplicates::{self, DuplicateMatch, DuplicateSearch};
use crate::remediation::lock::{self, MarkerState};
use crate::remediation::patch::{self, BranchPlan};
use crate::remediation::publisher::{self, Publication};
use crate::remediation::worker::WorkerContext;
use crate::tracker::Issue;
use crate::vcs::BranchManager;

/// What happened to one issue in a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueDisposition {
    /// The ledger says the issue is done (or out of attempts).
    AlreadyHandled(LookupOutcome),
    /// This process is already working on it.
    InFlight,
    /// Another instance holds a fresh marker. Nothing is recorded.
    LockedElsewhere,
    /// An attempt ran and its outcome was recorded.
    Recorded(IssueStatus),
}

/// Run the full pipeline for one issue. Every attempt that gets past the
/// lock ends in exactly one ledger write; only a ledger failure is returned
/// as an error.
pub async fn process_issue(
    ctx: &WorkerContext,
    project: &ProjectConfig,
    issue: &Issue,
) -> Result<IssueDisposition> {
    let span = tracing::info_span!("issue", issue_id = %issue.id, module = %project.module);
    async move {
        let bypass = ctx.config.poll.bypass_checks;

        if !bypass {
            let lookup = ctx.ledger.lookup(&issue.id).await?;
            if !lookup.should_process() {
                tracing::debug!(?lookup, "Already handled");
                return Ok(IssueDisposition::AlreadyHandled(lookup));
            }
            if let LookupOutcome::Retryable { attempts } = lookup {
                tracing::info!(attempt = attempts + 1, "Retrying issue");
            }
        }

        let Some(_claim) = ctx.active.claim(&issue.id) else {
            return Ok(IssueDisposition::InFlight);
        };

        let tracker = ctx.services.tracker.as_ref();
        if !bypass {
            let state = lock::check(
                tracker,
                &issue.id,
                &ctx.instance_id,
                ctx.config.poll.stale_after(),
            )
            .await;
            match state {
                MarkerState::HeldElsewhere { age_minutes, .. } => {
                    tracing::info!(age_minutes, "Issue is being processed by another instance");
                    return Ok(IssueDisposition::LockedElsewhere);
                }
                MarkerState::Stale { age_minutes } => {
                    tracing::info!(age_minutes, "Found stale marker, proceeding");
                }
                MarkerState::Free | MarkerState::Ours => {}
            }
        }
        lock::acquire(tracker, &issue.id, &project.module, &ctx.instance_id).await;

        tracing::info!(title = %issue.title, count = issue.count, level = ?issue.level, "Processing issue");

        let outcome = {
            let _checkout = ctx.checkout_locks.lock(&project.module).await;
            let vcs = ctx.services.checkouts.checkout_for(project);
            let vcs = vcs.as_ref();
            match patch::with_branch_restored(vcs, attempt(ctx, project, issue, vcs)).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(error = %format!("{:#}", e), "Issue processing failed");
                    IssueOutcome::new(&issue.id, &project.module, &issue.title, IssueStatus::Error)
                        .with_error(format!("{:#}", e))
                }
            }
        };

        let status = outcome.status;
        let row = ctx.ledger.record(outcome.clone()).await?;
        tracing::info!(status = %status, attempts = row.attempts, "Recorded outcome");

        if ctx.config.poll.post_status_notes {
            let note = status_note(&outcome);
            if let Err(e) = tracker.add_note(&issue.id, &note).await {
                tracing::warn!(error = %format!("{:#}", e), "Could not post status note");
            }
        }

        Ok(IssueDisposition::Recorded(status))
    }
    .instrument(span)
    .await
}

/// Context, analysis, duplicate search, patch and publish. Runs inside the
/// branch-restoring wrapper.
async fn attempt(
    ctx: &WorkerContext,
    project: &ProjectConfig,
    issue: &Issue,
    vcs: &dyn BranchManager,
) -> Result<IssueOutcome> {
    let settings = &ctx.config;
    let analysis_ctx = context::gather(
        ctx.services.tracker.as_ref(),
        project,
        issue,
        settings.poll.context_line_limit,
    )
    .await?;
    let issue = &analysis_ctx.issue;

    let verdict = analyzer::analyze(ctx.services.agent.as_ref(), &ctx.retry, &analysis_ctx)
        .await
        .context("Analysis failed")?;
    let analysis = match verdict {
        AnalysisVerdict::Accepted(analysis) => analysis,
        AnalysisVerdict::Rejected { reason } => {
            tracing::info!(reason = %reason, "Skipping issue");
            return Ok(
                IssueOutcome::new(&issue.id, &project.module, &issue.title, IssueStatus::Skipped)
                    .with_error(reason),
            );
        }
    };

    let keywords = duplicates::extract_keywords(issue, &analysis);
    let search = DuplicateSearch {
        hosting: ctx.services.hosting.as_ref(),
        repo: &project.repo_path,
        list_limit: settings.poll.change_request_list_limit,
        lookback: chrono::Duration::days(settings.poll.duplicate_lookback_days),
        now: Utc::now(),
    };
    let existing = match search.find(&keywords).await {
        DuplicateMatch::Open {
            change_request,
            keyword,
        } => {
            tracing::info!(change_request = change_request.number, keyword = %keyword, "Revising open change request");
            Some(change_request)
        }
        DuplicateMatch::Closed {
            change_request,
            keyword,
        } => {
            tracing::info!(change_request = change_request.number, keyword = %keyword, "Similar change request was closed, opening a new one");
            None
        }
        DuplicateMatch::None => None,
    };

    let plan = match &existing {
        Some(cr) => BranchPlan::Revise {
            branch: cr.branch.clone(),
        },
        None => BranchPlan::New {
            branch: patch::branch_name(&settings.git.branch_prefix, Utc::now()),
        },
    };

    let applied = match patch::apply_fix(vcs, &plan, issue, &analysis).await {
        Ok(applied) => applied,
        Err(e) => {
            let message = match e.downcast_ref::<PatchError>() {
                Some(patch_error) => format!("Failed to apply fix: {}", patch_error),
                None => format!("Failed to apply fix: {:#}", e),
            };
            tracing::warn!(error = %message, "Fix not applied");
            return Ok(
                IssueOutcome::new(&issue.id, &project.module, &issue.title, IssueStatus::Error)
                    .with_error(message),
            );
        }
    };

    let publication = Publication {
        module: &project.module,
        repo: &project.repo_path,
        trunk: vcs.trunk(),
        issue,
        analysis: &analysis,
        applied: &applied,
    };
    publisher::publish(ctx.services.hosting.as_ref(), &publication, existing.as_ref()).await
}

fn status_note(outcome: &IssueOutcome) -> String {
    match outcome.status {
        IssueStatus::Success => format!(
            "🤖 Autofix opened a pull request: {}",
            outcome.change_request_url.as_deref().unwrap_or("")
        ),
        IssueStatus::Updated => format!(
            "🤖 Autofix updated an existing pull request: {}",
            outcome.change_request_url.as_deref().unwrap_or("")
        ),
        IssueStatus::Skipped => format!(
            "🤖 Autofix skipped this issue: {}",
            outcome.error_message.as_deref().unwrap_or("")
        ),
        IssueStatus::Failed | IssueStatus::Error => format!(
            "🤖 Autofix could not fix this issue: {}",
            outcome.error_message.as_deref().unwrap_or("")
        ),
    }
}
