//! Configuration view and validation commands: `autofix config`.

use std::path::Path;

use anyhow::Result;

use autofix::config::AutofixConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", console::style("Autofix Configuration").bold().cyan());
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No autofix.toml found at {} (using defaults)", config_path.display());
            }
            let config = AutofixConfig::resolve(config_path)?;
            println!(
                "Tracker token: {}",
                if config.auth_token.is_some() { "set" } else { "not set" }
            );
            println!();
            println!("Effective values (with environment overrides):");
            println!();
            print!("{}", toml::to_string_pretty(&config)?);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = AutofixConfig::resolve(config_path)?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", console::style(warning).yellow());
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("autofix.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            AutofixConfig::default().save(config_path)?;

            println!("Created autofix.toml at {}", config_path.display());
            println!();
            println!("Next steps:");
            println!("  - set [tracker] org_slug (or SENTRY_ORG_SLUG)");
            println!("  - add [[projects]] entries (or SENTRY_PROJECTS)");
            println!("  - export SENTRY_AUTH_TOKEN");
            println!();
        }
    }

    Ok(())
}
