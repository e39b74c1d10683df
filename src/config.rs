//! Configuration for the autofix orchestrator.
//!
//! Settings are merged from three layers:
//! 1. `.autofix/autofix.toml` (every field has a default)
//! 2. Environment variables (after `.env` is loaded)
//! 3. CLI flags, applied by the command handlers

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_DIR: &str = ".autofix";
pub const CONFIG_FILE: &str = "autofix.toml";

/// One monitored project: a tracker project and its local checkout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectConfig {
    /// Short key used in the ledger and logs (e.g. `php`, `go`).
    pub module: String,
    pub project_id: String,
    pub project_slug: String,
    pub repo_path: PathBuf,
}

impl ProjectConfig {
    /// Parse one `module:project_id:project_slug:repo_path` entry.
    /// The repository path may itself contain colons.
    pub fn parse_compact(entry: &str) -> Option<Self> {
        let mut parts = entry.trim().splitn(4, ':');
        let module = parts.next()?.trim();
        let project_id = parts.next()?.trim();
        let project_slug = parts.next()?.trim();
        let repo_path = parts.next()?.trim();
        if [module, project_id, project_slug, repo_path]
            .iter()
            .any(|p| p.is_empty())
        {
            return None;
        }
        Some(Self {
            module: module.to_string(),
            project_id: project_id.to_string(),
            project_slug: project_slug.to_string(),
            repo_path: expand_home(Path::new(repo_path)),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub org_slug: String,
    /// Rolling window passed to the issue listing (e.g. `24h`).
    #[serde(default = "default_window")]
    pub window: String,
    #[serde(default = "default_api_delay_ms")]
    pub api_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://sentry.io".to_string()
}

fn default_window() -> String {
    "24h".to_string()
}

fn default_api_delay_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            org_slug: String::new(),
            window: default_window(),
            api_delay_ms: default_api_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_true")]
    pub skip_permissions: bool,
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_true() -> bool {
    true
}

fn default_agent_timeout_secs() -> u64 {
    900
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_retry_backoff_secs() -> u64 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            skip_permissions: true,
            timeout_secs: default_agent_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitConfig {
    #[serde(default = "default_trunk")]
    pub trunk: String,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_trunk() -> String {
    "master".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch_prefix() -> String {
    "sentry-auto-fix-".to_string()
}

fn default_command_timeout_secs() -> u64 {
    60
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            trunk: default_trunk(),
            remote: default_remote(),
            branch_prefix: default_branch_prefix(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_poll_startup_delay_secs")]
    pub startup_delay_secs: u64,
    #[serde(default = "default_issue_delay_secs")]
    pub issue_delay_secs: u64,
    #[serde(default = "default_project_delay_secs")]
    pub project_delay_secs: u64,
    /// Issues attempted per cycle; the remainder waits for the next cycle.
    /// Issues skipped as handled, in flight or locked elsewhere do not count.
    #[serde(default)]
    pub max_issues_per_cycle: Option<usize>,
    #[serde(default = "default_stale_marker_minutes")]
    pub stale_marker_minutes: i64,
    /// Skip the ledger terminal check and the cross-instance lock.
    #[serde(default)]
    pub bypass_checks: bool,
    #[serde(default = "default_true")]
    pub post_status_notes: bool,
    #[serde(default = "default_context_line_limit")]
    pub context_line_limit: usize,
    #[serde(default = "default_duplicate_lookback_days")]
    pub duplicate_lookback_days: i64,
    #[serde(default = "default_change_request_list_limit")]
    pub change_request_list_limit: u32,
}

fn default_poll_interval_secs() -> u64 {
    900
}

fn default_poll_startup_delay_secs() -> u64 {
    30
}

fn default_issue_delay_secs() -> u64 {
    3
}

fn default_project_delay_secs() -> u64 {
    2
}

fn default_stale_marker_minutes() -> i64 {
    30
}

fn default_context_line_limit() -> usize {
    200
}

fn default_duplicate_lookback_days() -> i64 {
    30
}

fn default_change_request_list_limit() -> u32 {
    50
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval_secs(),
            startup_delay_secs: default_poll_startup_delay_secs(),
            issue_delay_secs: default_issue_delay_secs(),
            project_delay_secs: default_project_delay_secs(),
            max_issues_per_cycle: None,
            stale_marker_minutes: default_stale_marker_minutes(),
            bypass_checks: false,
            post_status_notes: true,
            context_line_limit: default_context_line_limit(),
            duplicate_lookback_days: default_duplicate_lookback_days(),
            change_request_list_limit: default_change_request_list_limit(),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn issue_delay(&self) -> Duration {
        Duration::from_secs(self.issue_delay_secs)
    }

    pub fn project_delay(&self) -> Duration {
        Duration::from_secs(self.project_delay_secs)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stale_marker_minutes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_monitor_startup_delay_secs")]
    pub startup_delay_secs: u64,
}

fn default_monitor_interval_secs() -> u64 {
    600
}

fn default_monitor_startup_delay_secs() -> u64 {
    60
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_monitor_interval_secs(),
            startup_delay_secs: default_monitor_startup_delay_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("autofix.db")
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Directory for daily-rolling log files; stderr only when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub json: bool,
}

/// The complete autofix.toml configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AutofixConfig {
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
    /// Tracker API token. Only ever read from the environment.
    #[serde(skip)]
    pub auth_token: Option<String>,
}

impl AutofixConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse autofix.toml")
    }

    /// Load the file if it exists, otherwise the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize autofix.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Load the file layer, then the process environment.
    pub fn resolve(path: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(path)?;
        for warning in config.apply_env(|key| std::env::var(key).ok()) {
            tracing::warn!("{}", warning);
        }
        config.expand_paths();
        Ok(config)
    }

    /// Apply environment overrides through `lookup`. Returns warnings for
    /// values that were ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = non_empty("SENTRY_AUTH_TOKEN") {
            self.auth_token = Some(token);
        }
        if let Some(org) = non_empty("SENTRY_ORG_SLUG") {
            self.tracker.org_slug = org;
        }
        if let Some(path) = non_empty("SENTRY_DB_PATH") {
            self.ledger.path = PathBuf::from(path);
        }
        if let Some(cmd) = non_empty("CLAUDE_CMD") {
            self.agent.command = cmd;
        }
        if let Some(projects) = non_empty("SENTRY_PROJECTS") {
            let mut parsed = Vec::new();
            for entry in projects.split(',').filter(|e| !e.trim().is_empty()) {
                match ProjectConfig::parse_compact(entry) {
                    Some(project) => parsed.push(project),
                    None => warnings.push(format!(
                        "Ignoring malformed SENTRY_PROJECTS entry '{}': expected module:project_id:project_slug:repo_path",
                        entry.trim()
                    )),
                }
            }
            self.projects = parsed;
        }
        warnings
    }

    fn expand_paths(&mut self) {
        self.ledger.path = expand_home(&self.ledger.path);
        if let Some(dir) = &self.logging.dir {
            self.logging.dir = Some(expand_home(dir));
        }
        for project in &mut self.projects {
            project.repo_path = expand_home(&project.repo_path);
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.projects.is_empty() {
            warnings.push(
                "No projects configured: add [[projects]] entries or set SENTRY_PROJECTS".to_string(),
            );
        }

        let mut seen = HashSet::new();
        for project in &self.projects {
            if !seen.insert(project.module.as_str()) {
                warnings.push(format!("Duplicate project module '{}'", project.module));
            }
            if !project.repo_path.exists() {
                warnings.push(format!(
                    "Repository path for '{}' does not exist: {}",
                    project.module,
                    project.repo_path.display()
                ));
            }
        }

        if self.tracker.org_slug.trim().is_empty() {
            warnings.push("tracker.org_slug is empty (set it or SENTRY_ORG_SLUG)".to_string());
        }
        if self.auth_token.is_none() {
            warnings.push("SENTRY_AUTH_TOKEN is not set".to_string());
        }
        if self.poll.interval_secs == 0 {
            warnings.push("poll.interval_secs must be greater than zero".to_string());
        }
        if self.monitor.enabled && self.monitor.interval_secs == 0 {
            warnings.push("monitor.interval_secs must be greater than zero".to_string());
        }
        if self.agent.retry_attempts == 0 {
            warnings.push("agent.retry_attempts of 0 is treated as 1".to_string());
        }
        if self.git.branch_prefix.trim().is_empty() {
            warnings.push("git.branch_prefix is empty; checkout reconciliation is disabled".to_string());
        }

        warnings
    }

    pub fn project(&self, module: &str) -> Option<&ProjectConfig> {
        self.projects.iter().find(|p| p.module == module)
    }
}

/// Default config location under `base`.
pub fn default_config_path(base: &Path) -> PathBuf {
    base.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    path.to_path_buf()
}
