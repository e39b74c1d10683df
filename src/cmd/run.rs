//! Daemon and one-shot pipeline commands: `autofix run`, `autofix poll`,
//! `autofix monitor`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;

use autofix::agent::ClaudeCli;
use autofix::config::AutofixConfig;
use autofix::hosting::GhCli;
use autofix::ledger::{LedgerDb, LedgerHandle};
use autofix::remediation::{self, CycleReport, MonitorReport, Services, WorkerContext};
use autofix::status::{self, StatusState};
use autofix::tracker::SentryClient;
use autofix::vcs::GitCheckouts;

/// Resolve configuration and log its warnings.
fn load_config(config_path: &Path) -> Result<AutofixConfig> {
    let config = AutofixConfig::resolve(config_path)?;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    Ok(config)
}

/// Wire the production collaborators into a worker context.
fn build_context(config: AutofixConfig) -> Result<WorkerContext> {
    let token = config
        .auth_token
        .clone()
        .context("SENTRY_AUTH_TOKEN is not set")?;
    if config.tracker.org_slug.trim().is_empty() {
        anyhow::bail!("No tracker organization configured: set tracker.org_slug or SENTRY_ORG_SLUG");
    }
    if config.projects.is_empty() {
        anyhow::bail!("No projects configured: add [[projects]] entries or set SENTRY_PROJECTS");
    }

    let tracker = SentryClient::new(
        &config.tracker.base_url,
        &config.tracker.org_slug,
        &token,
        Duration::from_secs(config.tracker.request_timeout_secs),
        Duration::from_millis(config.tracker.api_delay_ms),
    )?;
    let hosting = GhCli::new(Duration::from_secs(config.git.command_timeout_secs));
    let agent = ClaudeCli::new(
        &config.agent.command,
        config.agent.skip_permissions,
        Duration::from_secs(config.agent.timeout_secs),
    );
    let checkouts = GitCheckouts::new(config.git.clone());

    let db = LedgerDb::new(&config.ledger.path)
        .with_context(|| format!("Failed to open ledger at {}", config.ledger.path.display()))?;

    let services = Services {
        tracker: Arc::new(tracker),
        hosting: Arc::new(hosting),
        agent: Arc::new(agent),
        checkouts: Arc::new(checkouts),
    };
    Ok(WorkerContext::new(services, LedgerHandle::new(db), config))
}

fn apply_overrides(config: &mut AutofixConfig, max_issues: Option<usize>, bypass_checks: bool) {
    if max_issues.is_some() {
        config.poll.max_issues_per_cycle = max_issues;
    }
    if bypass_checks {
        config.poll.bypass_checks = true;
    }
}

/// Flip the shutdown flag on the first Ctrl-C.
fn spawn_ctrl_c(tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping after the current issue");
            let _ = tx.send(true);
        }
    });
}

pub async fn cmd_run(
    config_path: &Path,
    status_port: Option<u16>,
    max_issues: Option<usize>,
    bypass_checks: bool,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    apply_overrides(&mut config, max_issues, bypass_checks);
    let monitor_enabled = config.monitor.enabled;
    let modules: Vec<String> = config.projects.iter().map(|p| p.module.clone()).collect();
    let ctx = build_context(config)?;

    println!(
        "{} watching {} project(s): {}",
        console::style("Autofix").bold().cyan(),
        modules.len(),
        modules.join(", ")
    );

    let (tx, rx) = watch::channel(false);
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(remediation::run_forever(ctx.clone(), rx.clone())));
    if monitor_enabled {
        tasks.push(tokio::spawn(remediation::run_monitor_forever(
            ctx.clone(),
            rx.clone(),
        )));
    }
    if let Some(port) = status_port {
        let state = Arc::new(StatusState {
            ledger: ctx.ledger.clone(),
            active: ctx.active.clone(),
            modules,
        });
        let shutdown = rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = status::serve(state, port, shutdown).await {
                tracing::error!(error = %format!("{:#}", e), "Status server failed");
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    println!("\nShutting down after the current issue...");
    let _ = tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Background task panicked");
        }
    }
    println!("Stopped.");
    Ok(())
}

pub async fn cmd_poll(config_path: &Path, max_issues: Option<usize>, bypass_checks: bool) -> Result<()> {
    let mut config = load_config(config_path)?;
    apply_overrides(&mut config, max_issues, bypass_checks);
    let ctx = build_context(config)?;

    let (tx, mut rx) = watch::channel(false);
    spawn_ctrl_c(tx);
    let report = remediation::run_cycle(&ctx, &mut rx).await;
    print_cycle_report(&report);
    Ok(())
}

pub async fn cmd_monitor(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let ctx = build_context(config)?;
    let report = remediation::run_sweep(&ctx).await?;
    print_monitor_report(&report);
    Ok(())
}

fn print_cycle_report(report: &CycleReport) {
    println!();
    println!("{}", console::style("Poll cycle").bold().cyan());
    println!("  Projects:        {}", report.projects);
    if !report.skipped_projects.is_empty() {
        println!(
            "  Skipped:         {}",
            console::style(report.skipped_projects.join(", ")).yellow()
        );
    }
    println!("  Issues seen:     {}", report.issues_seen);
    println!("  Qualifying:      {}", report.qualifying);
    println!("  Already handled: {}", report.already_handled);
    println!("  Locked elsewhere:{:>2}", report.locked_elsewhere);
    for (status, count) in &report.recorded {
        println!("  {:<16} {}", format!("{}:", status), count);
    }
    if report.capped {
        println!("  {}", console::style("Issue cap reached").dim());
    }
    if report.interrupted {
        println!("  {}", console::style("Interrupted").yellow());
    }
    println!();
}

fn print_monitor_report(report: &MonitorReport) {
    println!();
    println!("{}", console::style("PR monitor sweep").bold().cyan());
    println!("  Change requests: {}", report.change_requests);
    println!("  Not open:        {}", report.not_open);
    println!("  Comments seen:   {}", report.comments_seen);
    println!("  Own comments:    {}", report.own_comments);
    println!("  Already handled: {}", report.already_processed);
    println!("  Deferred:        {}", report.deferred);
    for (action, count) in &report.actions {
        println!("  {:<16} {}", format!("{}:", action), count);
    }
    println!();
}
