//! Issue-tracker seam: the read/annotate operations the orchestrator needs
//! from the error-tracking service.

pub mod sentry;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub use sentry::SentryClient;

#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Unresolved issues of one project seen within `window` (e.g. `24h`).
    async fn list_unresolved_issues(&self, project_slug: &str, window: &str) -> Result<Vec<Issue>>;

    /// Full issue record plus the most recent captured event, when one exists.
    async fn get_issue_detail(&self, issue_id: &str) -> Result<IssueDetail>;

    async fn list_notes(&self, issue_id: &str) -> Result<Vec<Note>>;

    async fn add_note(&self, issue_id: &str, text: &str) -> Result<()>;
}

/// A deduplicated error record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Event count over the listing window. The tracker reports it as a string.
    #[serde(default, deserialize_with = "count_from_string_or_number")]
    pub count: u64,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub culprit: Option<String>,
    #[serde(default)]
    pub metadata: IssueMetadata,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default)]
    pub short_id: Option<String>,
}

impl Issue {
    /// Human-facing reference for commit messages and PR bodies.
    pub fn reference(&self) -> String {
        match (&self.short_id, &self.permalink) {
            (Some(short), Some(link)) => format!("{} ({})", short, link),
            (None, Some(link)) => link.clone(),
            (Some(short), None) => short.clone(),
            (None, None) => self.id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueMetadata {
    #[serde(default, rename = "type")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

fn count_from_string_or_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Count {
        Number(u64),
        Text(String),
        Missing(Option<()>),
    }

    match Count::deserialize(deserializer)? {
        Count::Number(n) => Ok(n),
        Count::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
        Count::Missing(_) => Ok(0),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueDetail {
    pub issue: Issue,
    pub latest_event: Option<Event>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, rename = "eventID")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub entries: Vec<EventEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub abs_path: Option<String>,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub line_no: Option<u32>,
    #[serde(default)]
    pub in_app: Option<bool>,
}

#[derive(Deserialize)]
struct ExceptionData {
    #[serde(default)]
    values: Vec<ExceptionValue>,
}

#[derive(Deserialize)]
struct ExceptionValue {
    #[serde(default)]
    stacktrace: Option<Stacktrace>,
}

#[derive(Deserialize)]
struct Stacktrace {
    #[serde(default)]
    frames: Vec<Frame>,
}

impl Event {
    /// The raw `exception` entry, as handed to the agent.
    pub fn exception(&self) -> Option<&EventEntry> {
        self.entries.iter().find(|e| e.kind == "exception")
    }

    /// All frames of the exception, oldest first (the tracker's order).
    pub fn frames(&self) -> Vec<Frame> {
        let Some(entry) = self.exception() else {
            return Vec::new();
        };
        let Ok(data) = serde_json::from_value::<ExceptionData>(entry.data.clone()) else {
            return Vec::new();
        };
        data.values
            .into_iter()
            .filter_map(|v| v.stacktrace)
            .flat_map(|s| s.frames)
            .collect()
    }

    /// The frame closest to the crash: the innermost in-app frame, else the
    /// innermost frame.
    pub fn top_frame(&self) -> Option<Frame> {
        let frames = self.frames();
        frames
            .iter()
            .rev()
            .find(|f| f.in_app == Some(true))
            .or_else(|| frames.last())
            .cloned()
    }
}

/// A free-text note attached to an issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub date_created: DateTime<Utc>,
    pub text: String,
}
