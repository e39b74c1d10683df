//! PR Monitor: reacts to reviewer comments on the change requests the
//! orchestrator opened.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::Instrument;

use crate::agent::contract::{CommentReview, parse_contract};
use crate::agent::prompts;
use crate::config::ProjectConfig;
use crate::hosting::{
    BOT_COMMENT_PREFIX, ChangeRequest, ChangeRequestState, ReviewComment,
    parse_change_request_number,
};
use crate::ledger::{CommentAction, ProcessedComment};
use crate::remediation::patch;
use crate::remediation::scheduler::pause;
use crate::remediation::worker::WorkerContext;
use crate::vcs::BranchManager;

/// Outcome of one monitor sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorReport {
    pub change_requests: usize,
    pub not_open: usize,
    pub comments_seen: usize,
    pub own_comments: usize,
    pub already_processed: usize,
    /// Comments left for a later sweep (dirty checkout, unknown project).
    pub deferred: usize,
    pub actions: BTreeMap<String, usize>,
}

impl MonitorReport {
    fn count(&mut self, action: CommentAction) {
        *self.actions.entry(action.as_str().to_string()).or_default() += 1;
    }
}

/// Result of a revision attempt that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Revision {
    Pushed { commit: String },
    NoDiff,
}

/// One tracked change request, resolved against its project.
struct Tracked<'a> {
    project: &'a ProjectConfig,
    change_request: ChangeRequest,
    /// Ledger key for the comment records.
    key: String,
}

/// One pass over every tracked change request.
pub async fn run_sweep(ctx: &WorkerContext) -> Result<MonitorReport> {
    let rows = ctx
        .ledger
        .call(|db| db.tracked_change_requests())
        .await
        .context("Failed to read tracked change requests")?;

    let mut report = MonitorReport::default();
    let mut seen = HashSet::new();
    for row in rows {
        let Some(url) = row.change_request_url.clone() else {
            continue;
        };
        if !seen.insert(url.clone()) {
            continue;
        }
        let Some(project) = ctx.config.project(&row.module) else {
            tracing::warn!(module = %row.module, url = %url, "Change request belongs to an unconfigured project");
            continue;
        };
        let Some(number) = parse_change_request_number(&url) else {
            tracing::warn!(url = %url, "Could not parse change request number");
            continue;
        };

        let span = tracing::info_span!("change_request", number, module = %project.module);
        if let Err(e) = sweep_change_request(ctx, project, number, &url, &mut report)
            .instrument(span)
            .await
        {
            tracing::error!(url = %url, error = %format!("{:#}", e), "Change request sweep failed");
        }
    }

    tracing::info!(
        change_requests = report.change_requests,
        comments = report.comments_seen,
        actioned = report.actions.values().sum::<usize>(),
        "Monitor sweep complete"
    );
    Ok(report)
}

async fn sweep_change_request(
    ctx: &WorkerContext,
    project: &ProjectConfig,
    number: u64,
    url: &str,
    report: &mut MonitorReport,
) -> Result<()> {
    let hosting = ctx.services.hosting.as_ref();
    let change_request = hosting.get_change_request(&project.repo_path, number).await?;
    report.change_requests += 1;
    if change_request.state != ChangeRequestState::Open {
        report.not_open += 1;
        tracing::info!(state = change_request.state.as_str(), "Change request is no longer open, untracking");
        ctx.ledger
            .mark_change_request_closed(url, change_request.state.as_str())
            .await?;
        return Ok(());
    }

    let comments = hosting.list_comments(&project.repo_path, number).await?;
    let tracked = Tracked {
        project,
        change_request,
        key: url.to_string(),
    };

    for comment in comments {
        report.comments_seen += 1;
        if comment.is_from_bot() {
            report.own_comments += 1;
            continue;
        }
        if ctx
            .ledger
            .is_comment_processed(&tracked.key, &comment.id)
            .await?
        {
            report.already_processed += 1;
            continue;
        }
        match handle_comment(ctx, &tracked, &comment).await? {
            Some(action) => report.count(action),
            None => report.deferred += 1,
        }
    }
    Ok(())
}

/// Classify one reviewer comment and act on it. Returns the recorded
/// action, or `None` when the comment was left for a later sweep.
async fn handle_comment(
    ctx: &WorkerContext,
    tracked: &Tracked<'_>,
    comment: &ReviewComment,
) -> Result<Option<CommentAction>> {
    let cr = &tracked.change_request;
    tracing::info!(comment_id = %comment.id, author = %comment.author, kind = comment.kind.as_str(), "New reviewer comment");

    let review = match classify(ctx, tracked, comment).await {
        Ok(review) => review,
        Err(e) => {
            tracing::warn!(comment_id = %comment.id, error = %format!("{:#}", e), "Could not classify comment");
            let reply = unprocessed_reply(comment, &e);
            respond(ctx, tracked, comment, CommentAction::Failed, &reply).await?;
            return Ok(Some(CommentAction::Failed));
        }
    };

    if !review.needs_revision {
        tracing::info!(summary = %review.summary, "Comment needs no revision");
        record(ctx, tracked, comment, CommentAction::NoRevisionNeeded).await?;
        return Ok(Some(CommentAction::NoRevisionNeeded));
    }

    let _checkout = ctx.checkout_locks.lock(&tracked.project.module).await;
    let vcs = ctx.services.checkouts.checkout_for(tracked.project);
    let vcs = vcs.as_ref();
    if vcs.has_changes().await? {
        tracing::warn!(repo = %tracked.project.repo_path.display(), "Checkout has uncommitted changes, deferring revision");
        return Ok(None);
    }

    let outcome = patch::with_branch_restored(vcs, revise(ctx, vcs, tracked, comment, &review)).await;
    let (action, reply) = match outcome {
        Ok(Revision::Pushed { commit }) => {
            tracing::info!(commit = %commit, branch = %cr.branch, "Revision pushed");
            (CommentAction::Revised, revised_reply(comment, &review, &commit))
        }
        Ok(Revision::NoDiff) => {
            tracing::info!("Revision produced no changes");
            (CommentAction::NoChanges, no_changes_reply(comment, &review))
        }
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Revision failed");
            (CommentAction::Failed, failed_reply(comment, &e))
        }
    };

    respond(ctx, tracked, comment, action, &reply).await?;
    Ok(Some(action))
}

/// Record the action, then answer the reviewer. The comment is not retried
/// if the reply fails to post.
async fn respond(
    ctx: &WorkerContext,
    tracked: &Tracked<'_>,
    comment: &ReviewComment,
    action: CommentAction,
    reply: &str,
) -> Result<()> {
    record(ctx, tracked, comment, action).await?;
    if let Err(e) = ctx
        .services
        .hosting
        .post_comment(&tracked.project.repo_path, tracked.change_request.number, reply)
        .await
    {
        tracing::warn!(error = %format!("{:#}", e), "Could not reply on change request");
    }
    Ok(())
}

async fn classify(
    ctx: &WorkerContext,
    tracked: &Tracked<'_>,
    comment: &ReviewComment,
) -> Result<CommentReview> {
    let prompt = prompts::comment_review_prompt(&tracked.change_request, comment);
    let prompt = prompt.as_str();
    let dir = tracked.project.repo_path.as_path();
    let agent = ctx.services.agent.as_ref();
    let response = ctx
        .retry
        .retry_on_timeout("comment review", move || agent.ask(prompt, dir))
        .await?;
    Ok(parse_contract(&response)?)
}

/// Check out the request's branch, let the agent edit it, and push the
/// result if there is one.
async fn revise(
    ctx: &WorkerContext,
    vcs: &dyn BranchManager,
    tracked: &Tracked<'_>,
    comment: &ReviewComment,
    review: &CommentReview,
) -> Result<Revision> {
    let cr = &tracked.change_request;
    vcs.checkout_remote_branch(&cr.branch).await?;

    let prompt = prompts::revision_prompt(cr, comment, review);
    let prompt = prompt.as_str();
    let dir = vcs.repo_path();
    let agent = ctx.services.agent.as_ref();
    ctx.retry
        .retry_on_timeout("revision", move || agent.edit(prompt, dir))
        .await
        .context("Agent revision failed")?;

    if !vcs.has_changes().await? {
        return Ok(Revision::NoDiff);
    }
    let commit = vcs.commit_all(&revision_commit_message(comment, review)).await?;
    vcs.rebase_onto_upstream(&cr.branch).await?;
    vcs.push(&cr.branch, false).await?;
    Ok(Revision::Pushed { commit })
}

async fn record(
    ctx: &WorkerContext,
    tracked: &Tracked<'_>,
    comment: &ReviewComment,
    action: CommentAction,
) -> Result<()> {
    let inserted = ctx
        .ledger
        .record_comment(ProcessedComment {
            change_request_id: tracked.key.clone(),
            comment_id: comment.id.clone(),
            comment_type: comment.kind.as_str().to_string(),
            body: comment.body.clone(),
            processed_at: Utc::now(),
            action_taken: action,
        })
        .await?;
    if !inserted {
        tracing::debug!(comment_id = %comment.id, "Comment was already recorded");
    }
    Ok(())
}

fn revision_commit_message(comment: &ReviewComment, review: &CommentReview) -> String {
    let summary: String = review.summary.chars().take(60).collect();
    format!(
        "Address review feedback: {}\n\nRequested by {} in comment {}.\n",
        summary, comment.author, comment.id
    )
}

fn quote(body: &str) -> String {
    body.lines()
        .take(5)
        .map(|l| format!("> {}", l))
        .collect::<Vec<_>>()
        .join("\n")
}

fn revised_reply(comment: &ReviewComment, review: &CommentReview, commit: &str) -> String {
    format!(
        "{} revised this pull request in response to @{}:\n\n{}\n\n**Summary:** {}\n\nPushed commit `{}`.",
        BOT_COMMENT_PREFIX,
        comment.author,
        quote(&comment.body),
        review.summary,
        commit
    )
}

fn no_changes_reply(comment: &ReviewComment, review: &CommentReview) -> String {
    format!(
        "{} looked at this comment from @{}:\n\n{}\n\n**Understood as:** {}\n\nNo code changes were produced. A human may need to make this change.",
        BOT_COMMENT_PREFIX,
        comment.author,
        quote(&comment.body),
        review.summary
    )
}

fn failed_reply(comment: &ReviewComment, error: &anyhow::Error) -> String {
    format!(
        "{} could not apply a revision for this comment from @{}:\n\n{}\n\n**Error:** {:#}\n\nThe branch was left unchanged.",
        BOT_COMMENT_PREFIX,
        comment.author,
        quote(&comment.body),
        error
    )
}

fn unprocessed_reply(comment: &ReviewComment, error: &anyhow::Error) -> String {
    format!(
        "{} could not process this comment from @{}:\n\n{}\n\n**Error:** {:#}\n\nIt will not be retried automatically. A human may need to follow up.",
        BOT_COMMENT_PREFIX,
        comment.author,
        quote(&comment.body),
        error
    )
}

/// Startup delay, then a sweep every `monitor.interval_secs` until shutdown.
pub async fn run_monitor_forever(ctx: WorkerContext, mut shutdown: watch::Receiver<bool>) {
    let startup = Duration::from_secs(ctx.config.monitor.startup_delay_secs);
    let interval = Duration::from_secs(ctx.config.monitor.interval_secs);
    tracing::info!(startup_secs = startup.as_secs(), interval_secs = interval.as_secs(), "PR monitor started");
    if !pause(startup, &mut shutdown).await {
        return;
    }
    loop {
        if let Err(e) = run_sweep(&ctx).await {
            tracing::error!(error = %format!("{:#}", e), "Monitor sweep failed");
        }
        if !pause(interval, &mut shutdown).await {
            break;
        }
    }
    tracing::info!("PR monitor stopped");
}
