//! Structured objects the agent must return, and their extraction from
//! free-text output.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Confidence {
    High,
    #[default]
    Low,
}

impl From<String> for Confidence {
    fn from(s: String) -> Self {
        if s.trim().eq_ignore_ascii_case("high") {
            Confidence::High
        } else {
            Confidence::Low
        }
    }
}

impl From<Confidence> for String {
    fn from(c: Confidence) -> Self {
        c.as_str().to_string()
    }
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FixType {
    Simple,
    #[default]
    Complex,
}

impl From<String> for FixType {
    fn from(s: String) -> Self {
        if s.trim().eq_ignore_ascii_case("simple") {
            FixType::Simple
        } else {
            FixType::Complex
        }
    }
}

impl From<FixType> for String {
    fn from(f: FixType) -> Self {
        f.as_str().to_string()
    }
}

impl FixType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixType::Simple => "simple",
            FixType::Complex => "complex",
        }
    }
}

/// Root-cause analysis and proposed patch for one issue. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueAnalysis {
    #[serde(default)]
    pub root_cause: String,
    pub can_fix: bool,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub fix_type: FixType,
    #[serde(default)]
    pub fix: String,
    #[serde(default)]
    pub fix_files: Vec<FileFix>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFix {
    pub path: String,
    #[serde(default)]
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    #[serde(rename = "type", default = "default_change_kind")]
    pub kind: String,
    /// Line range for reference only; matching uses `old`.
    #[serde(default)]
    pub lines: Option<String>,
    pub old: String,
    #[serde(default)]
    pub new: String,
}

fn default_change_kind() -> String {
    "replace".to_string()
}

/// Outcome of the three-way acceptance gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Accept,
    Reject { reason: String },
}

impl IssueAnalysis {
    /// A fix is accepted only when it is fixable, high confidence and simple.
    pub fn gate(&self) -> GateVerdict {
        let reason = self
            .reason
            .clone()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "no reason given".to_string());
        if !self.can_fix {
            GateVerdict::Reject { reason }
        } else if self.confidence != Confidence::High {
            GateVerdict::Reject {
                reason: format!("Low confidence: {}", reason),
            }
        } else if self.fix_type != FixType::Simple {
            GateVerdict::Reject {
                reason: format!("Complex fix: {}", reason),
            }
        } else {
            GateVerdict::Accept
        }
    }

    pub fn file_paths(&self) -> Vec<&str> {
        self.fix_files.iter().map(|f| f.path.as_str()).collect()
    }
}

/// Classification of one reviewer comment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentReview {
    pub needs_revision: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub requested_changes: Vec<String>,
}

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```json\s*\n(.+?)\n\s*```").expect("fenced json pattern is valid")
});

/// Pull the JSON object out of agent output: a fenced ```json block wins,
/// otherwise the span from the first `{` to the last `}`.
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(caps) = FENCED_JSON.captures(text)
        && let Some(body) = caps.get(1)
    {
        return Some(body.as_str().trim());
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Extract and deserialize a contract object from agent output.
pub fn parse_contract<T: DeserializeOwned>(text: &str) -> Result<T, AgentError> {
    let json = extract_json(text).ok_or(AgentError::NoStructuredOutput)?;
    serde_json::from_str(json).map_err(AgentError::ContractViolation)
}
