use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "autofix")]
#[command(version, about = "Automated remediation of recurring production errors")]
pub struct Cli {
    /// Path to autofix.toml (defaults to .autofix/autofix.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the poll scheduler and PR monitor until interrupted
    Run {
        /// Serve the read-only status API on this port
        #[arg(long)]
        status_port: Option<u16>,

        /// Maximum issues attempted per cycle
        #[arg(long)]
        max_issues: Option<usize>,

        /// Ignore the ledger and the cross-instance lock
        #[arg(long)]
        bypass_checks: bool,
    },
    /// Run exactly one poll cycle
    Poll {
        /// Maximum issues attempted in this cycle
        #[arg(long)]
        max_issues: Option<usize>,

        /// Ignore the ledger and the cross-instance lock
        #[arg(long)]
        bypass_checks: bool,
    },
    /// Run exactly one PR monitor sweep
    Monitor,
    /// Show ledger totals by status
    Stats,
    /// Show the most recent failed attempts
    Errors {
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
    /// Clear the issue ledger
    Reset {
        #[arg(long)]
        force: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default autofix.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => autofix::config::default_config_path(
            &std::env::current_dir().context("Failed to get current directory")?,
        ),
    };

    let _log_guard = cmd::init_logging(&cli, &config_path)?;

    match &cli.command {
        Commands::Run {
            status_port,
            max_issues,
            bypass_checks,
        } => cmd::cmd_run(&config_path, *status_port, *max_issues, *bypass_checks).await?,
        Commands::Poll {
            max_issues,
            bypass_checks,
        } => cmd::cmd_poll(&config_path, *max_issues, *bypass_checks).await?,
        Commands::Monitor => cmd::cmd_monitor(&config_path).await?,
        Commands::Stats => cmd::cmd_stats(&config_path)?,
        Commands::Errors { limit } => cmd::cmd_errors(&config_path, *limit)?,
        Commands::Reset { force } => cmd::cmd_reset(&config_path, *force)?,
        Commands::Config { command } => cmd::cmd_config(&config_path, command.clone())?,
    }

    Ok(())
}
