//! CLI command implementations.
//!
//! | Module   | Commands handled            |
//! |----------|-----------------------------|
//! | `run`    | `Run`, `Poll`, `Monitor`    |
//! | `ledger` | `Stats`, `Errors`, `Reset`  |
//! | `config` | `Config`                    |

pub mod config;
pub mod ledger;
pub mod run;

use std::path::Path;

use anyhow::Result;

use autofix::config::{AutofixConfig, expand_home};
use autofix::logging::{LogGuard, LogOptions, init_tracing};

use super::Cli;

pub use config::cmd_config;
pub use ledger::{cmd_errors, cmd_reset, cmd_stats};
pub use run::{cmd_monitor, cmd_poll, cmd_run};

/// Install logging before the full config is resolved so that config
/// warnings are captured. Only the `[logging]` section is read here; a
/// broken file is reported later by the command itself.
pub fn init_logging(cli: &Cli, config_path: &Path) -> Result<LogGuard> {
    let logging = AutofixConfig::load_or_default(config_path)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_tracing(&LogOptions {
        verbose: cli.verbose,
        json: cli.log_json || logging.json,
        dir: logging.dir.as_deref().map(expand_home),
    })
}
