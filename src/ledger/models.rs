use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Issues that failed this many times are no longer retried.
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Success,
    Updated,
    Skipped,
    Failed,
    Error,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Updated => "updated",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }

    /// Whether a row with this status may be attempted again while it is
    /// under the attempt ceiling.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::Error)
    }
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "updated" => Ok(Self::Updated),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid issue status: {}", s)),
        }
    }
}

/// One row per tracker issue the orchestrator has attempted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedIssue {
    pub issue_id: String,
    pub module: String,
    pub title: Option<String>,
    pub status: IssueStatus,
    pub attempts: u32,
    pub change_request_url: Option<String>,
    pub error_message: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// What the ledger says about an issue before any work starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    Unseen,
    Retryable { attempts: u32 },
    Terminal { status: IssueStatus, attempts: u32 },
}

impl LookupOutcome {
    pub fn should_process(&self) -> bool {
        !matches!(self, LookupOutcome::Terminal { .. })
    }

    pub(crate) fn classify(status: IssueStatus, attempts: u32) -> Self {
        if status.is_retryable() && attempts < MAX_ATTEMPTS {
            LookupOutcome::Retryable { attempts }
        } else {
            LookupOutcome::Terminal { status, attempts }
        }
    }
}

/// The outcome of one attempt, as written to the ledger.
#[derive(Debug, Clone)]
pub struct IssueOutcome {
    pub issue_id: String,
    pub module: String,
    pub title: String,
    pub status: IssueStatus,
    pub change_request_url: Option<String>,
    pub error_message: Option<String>,
}

impl IssueOutcome {
    pub fn new(issue_id: &str, module: &str, title: &str, status: IssueStatus) -> Self {
        Self {
            issue_id: issue_id.to_string(),
            module: module.to_string(),
            title: title.to_string(),
            status,
            change_request_url: None,
            error_message: None,
        }
    }

    pub fn with_change_request(mut self, url: impl Into<String>) -> Self {
        self.change_request_url = Some(url.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// A reviewer comment the PR monitor has already acted on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedComment {
    pub change_request_id: String,
    pub comment_id: String,
    pub comment_type: String,
    pub body: String,
    pub processed_at: DateTime<Utc>,
    pub action_taken: CommentAction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommentAction {
    NoRevisionNeeded,
    Revised,
    NoChanges,
    Failed,
}

impl CommentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoRevisionNeeded => "no_revision_needed",
            Self::Revised => "revised",
            Self::NoChanges => "no_changes",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
}
