//! Ledger inspection commands: `autofix stats`, `autofix errors`,
//! `autofix reset`.

use std::path::Path;

use anyhow::{Context, Result};

use autofix::config::AutofixConfig;
use autofix::ledger::LedgerDb;

fn open_ledger(config_path: &Path) -> Result<LedgerDb> {
    let config = AutofixConfig::resolve(config_path)?;
    LedgerDb::new(&config.ledger.path)
        .with_context(|| format!("Failed to open ledger at {}", config.ledger.path.display()))
}

pub fn cmd_stats(config_path: &Path) -> Result<()> {
    let db = open_ledger(config_path)?;
    let stats = db.stats()?;

    println!();
    println!("{}", console::style("Ledger").bold().cyan());
    println!("  Total: {}", stats.total);
    for (status, count) in &stats.by_status {
        let label = format!("{:<8}", status);
        let label = match status.as_str() {
            "success" | "updated" => console::style(label).green(),
            "error" | "failed" => console::style(label).red(),
            _ => console::style(label).dim(),
        };
        println!("  {} {}", label, count);
    }
    println!();
    Ok(())
}

pub fn cmd_errors(config_path: &Path, limit: u32) -> Result<()> {
    let db = open_ledger(config_path)?;
    let rows = db.recent_errors(limit)?;

    println!();
    if rows.is_empty() {
        println!("No errors recorded.");
        println!();
        return Ok(());
    }
    for row in rows {
        println!(
            "{} {} [{}] {} (attempts: {})",
            console::style(row.last_seen_at.format("%Y-%m-%d %H:%M")).dim(),
            console::style(&row.issue_id).bold(),
            row.module,
            row.title.as_deref().unwrap_or(""),
            row.attempts
        );
        if let Some(message) = &row.error_message {
            println!("  {} {}", console::style(row.status.as_str()).red(), message);
        }
    }
    println!();
    Ok(())
}

pub fn cmd_reset(config_path: &Path, force: bool) -> Result<()> {
    use dialoguer::Confirm;

    let db = open_ledger(config_path)?;

    if !force {
        let confirm = Confirm::new()
            .with_prompt("This will forget every processed issue. Are you sure?")
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    let removed = db.clear()?;
    println!("Reset complete ({} issue(s) removed)", removed);
    Ok(())
}
