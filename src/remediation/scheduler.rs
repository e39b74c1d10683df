//! Poll Scheduler: periodic sweep across the configured projects.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::watch;

use crate::config::ProjectConfig;
use crate::remediation::processor::{self, IssueDisposition};
use crate::remediation::worker::WorkerContext;
use crate::tracker::Issue;
use crate::vcs::BranchManager;

const MIN_EVENT_COUNT: u64 = 10;

/// Frequent, severe, or explicitly prioritized issues are worth an attempt.
pub fn qualifies(issue: &Issue) -> bool {
    let severe = matches!(issue.level.as_deref(), Some("error") | Some("fatal"));
    let urgent = issue.priority.as_deref() == Some("high");
    issue.count >= MIN_EVENT_COUNT || severe || urgent
}

/// Outcome of one sweep over all projects.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub projects: usize,
    pub skipped_projects: Vec<String>,
    pub issues_seen: usize,
    pub qualifying: usize,
    pub already_handled: usize,
    pub in_flight: usize,
    pub locked_elsewhere: usize,
    /// Recorded outcomes by ledger status.
    pub recorded: BTreeMap<String, usize>,
    /// The per-cycle cap cut the sweep short.
    pub capped: bool,
    pub interrupted: bool,
}

impl CycleReport {
    pub fn attempted(&self) -> usize {
        self.recorded.values().sum()
    }

    fn count(&mut self, disposition: &IssueDisposition) {
        match disposition {
            IssueDisposition::AlreadyHandled(_) => self.already_handled += 1,
            IssueDisposition::InFlight => self.in_flight += 1,
            IssueDisposition::LockedElsewhere => self.locked_elsewhere += 1,
            IssueDisposition::Recorded(status) => {
                *self.recorded.entry(status.to_string()).or_default() += 1
            }
        }
    }
}

/// Put a checkout left on one of our work branches back on the trunk.
/// Leftover edits on such a branch belong to an interrupted attempt and are
/// dropped. Returns whether anything was switched.
pub async fn reconcile_checkout(vcs: &dyn BranchManager, branch_prefix: &str) -> Result<bool> {
    if branch_prefix.trim().is_empty() {
        return Ok(false);
    }
    let current = vcs.current_branch().await?;
    if !current.starts_with(branch_prefix) {
        return Ok(false);
    }
    tracing::warn!(branch = %current, trunk = vcs.trunk(), "Checkout left on a work branch, switching back to trunk");
    if vcs.has_changes().await? {
        vcs.discard_changes().await?;
    }
    vcs.checkout(vcs.trunk())
        .await
        .with_context(|| format!("Failed to switch from {} to {}", current, vcs.trunk()))?;
    Ok(true)
}

/// Reconcile the checkout and refuse to work on one with operator changes.
async fn prepare_checkout(ctx: &WorkerContext, project: &ProjectConfig) -> Result<bool> {
    let _checkout = ctx.checkout_locks.lock(&project.module).await;
    let vcs = ctx.services.checkouts.checkout_for(project);
    reconcile_checkout(vcs.as_ref(), &ctx.config.git.branch_prefix).await?;
    if vcs.has_changes().await? {
        tracing::warn!(module = %project.module, repo = %project.repo_path.display(), "Checkout has uncommitted changes, skipping project this cycle");
        return Ok(false);
    }
    Ok(true)
}

/// Sleep for `duration` unless shutdown is signalled first. Returns false
/// when the sleep was cut short.
pub async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    if duration.is_zero() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.wait_for(|stop| *stop) => false,
    }
}

/// One sweep: every project, every qualifying issue, strictly sequential.
pub async fn run_cycle(ctx: &WorkerContext, shutdown: &mut watch::Receiver<bool>) -> CycleReport {
    let settings = &ctx.config.poll;
    let cap = settings.max_issues_per_cycle;
    let mut report = CycleReport::default();
    let mut dispatched = 0usize;

    'projects: for (index, project) in ctx.config.projects.iter().enumerate() {
        if index > 0 && !pause(settings.project_delay(), shutdown).await {
            report.interrupted = true;
            break;
        }
        report.projects += 1;

        match prepare_checkout(ctx, project).await {
            Ok(true) => {}
            Ok(false) => {
                report.skipped_projects.push(project.module.clone());
                continue;
            }
            Err(e) => {
                tracing::error!(module = %project.module, error = %format!("{:#}", e), "Could not prepare checkout, skipping project");
                report.skipped_projects.push(project.module.clone());
                continue;
            }
        }

        let issues = match ctx
            .services
            .tracker
            .list_unresolved_issues(&project.project_slug, &ctx.config.tracker.window)
            .await
        {
            Ok(issues) => issues,
            Err(e) => {
                tracing::error!(module = %project.module, error = %format!("{:#}", e), "Failed to list issues");
                report.skipped_projects.push(project.module.clone());
                continue;
            }
        };
        report.issues_seen += issues.len();

        let qualifying: Vec<&Issue> = issues.iter().filter(|i| qualifies(i)).collect();
        report.qualifying += qualifying.len();
        tracing::info!(module = %project.module, seen = issues.len(), qualifying = qualifying.len(), "Project issues fetched");

        for issue in qualifying {
            if cap.is_some_and(|cap| dispatched >= cap) {
                tracing::info!(cap = cap.unwrap_or_default(), "Issue cap reached, deferring the rest to the next cycle");
                report.capped = true;
                break 'projects;
            }
            if *shutdown.borrow() {
                report.interrupted = true;
                break 'projects;
            }

            let disposition = match processor::process_issue(ctx, project, issue).await {
                Ok(disposition) => disposition,
                Err(e) => {
                    tracing::error!(issue_id = %issue.id, error = %format!("{:#}", e), "Ledger unavailable, skipping issue");
                    continue;
                }
            };
            report.count(&disposition);

            // Only real attempts count toward the cap and earn the delay.
            if !matches!(disposition, IssueDisposition::Recorded(_)) {
                continue;
            }
            dispatched += 1;
            if !pause(settings.issue_delay(), shutdown).await {
                report.interrupted = true;
                break 'projects;
            }
        }
    }

    tracing::info!(
        projects = report.projects,
        qualifying = report.qualifying,
        attempted = report.attempted(),
        already_handled = report.already_handled,
        "Poll cycle complete"
    );
    report
}

/// Startup delay, then a cycle every `poll.interval_secs` until shutdown.
pub async fn run_forever(ctx: WorkerContext, mut shutdown: watch::Receiver<bool>) {
    let startup = Duration::from_secs(ctx.config.poll.startup_delay_secs);
    tracing::info!(startup_secs = startup.as_secs(), interval_secs = ctx.config.poll.interval_secs, "Poll scheduler started");
    if !pause(startup, &mut shutdown).await {
        return;
    }
    loop {
        let report = run_cycle(&ctx, &mut shutdown).await;
        if report.interrupted || !pause(ctx.config.poll.interval(), &mut shutdown).await {
            break;
        }
    }
    tracing::info!("Poll scheduler stopped");
}
