//! Context Gatherer: assembles the read-only analysis payload for one issue.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::ProjectConfig;
use crate::remediation::patch::normalize_path;
use crate::tracker::{Frame, Issue, IssueTracker};

#[derive(Debug, Clone, Serialize)]
pub struct SourceSnippet {
    /// Repository-relative path.
    pub path: String,
    pub content: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisContext {
    pub module: String,
    pub repo_path: PathBuf,
    /// Full issue record, refreshed from the tracker.
    pub issue: Issue,
    /// The `exception` entry of the latest event.
    pub exception: Option<serde_json::Value>,
    pub top_frame: Option<Frame>,
    pub source_files: Vec<SourceSnippet>,
}

/// Fetch issue detail and the latest event, then read the source the top
/// frame points at. Only the detail fetch can fail; source reads are
/// best-effort.
pub async fn gather(
    tracker: &dyn IssueTracker,
    project: &ProjectConfig,
    issue: &Issue,
    line_limit: usize,
) -> Result<AnalysisContext> {
    let detail = tracker
        .get_issue_detail(&issue.id)
        .await
        .context("Failed to gather issue context")?;

    let top_frame = detail.latest_event.as_ref().and_then(|e| e.top_frame());
    let exception = detail
        .latest_event
        .as_ref()
        .and_then(|e| e.exception())
        .map(|entry| entry.data.clone());

    let candidates = source_candidates(top_frame.as_ref(), detail.issue.culprit.as_deref());
    let source_files = read_first_source(&project.repo_path, &candidates, line_limit)
        .into_iter()
        .collect();

    Ok(AnalysisContext {
        module: project.module.clone(),
        repo_path: project.repo_path.clone(),
        issue: detail.issue,
        exception,
        top_frame,
        source_files,
    })
}

/// Paths worth trying, most specific first.
fn source_candidates(frame: Option<&Frame>, culprit: Option<&str>) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(frame) = frame {
        candidates.extend(frame.filename.clone());
        candidates.extend(frame.abs_path.clone());
    }
    // Culprits are often "path/to/file.php in function"; keep the path part.
    if let Some(culprit) = culprit
        && let Some(first) = culprit.split_whitespace().next()
        && (first.contains('/') || first.contains('.'))
    {
        candidates.push(first.to_string());
    }
    candidates.dedup();
    candidates
}

fn read_first_source(repo: &Path, candidates: &[String], line_limit: usize) -> Option<SourceSnippet> {
    for raw in candidates {
        let Ok(relative) = normalize_path(repo, raw) else {
            continue;
        };
        let full = repo.join(&relative);
        let Ok(content) = std::fs::read_to_string(&full) else {
            continue;
        };
        let total = content.lines().count();
        let head: Vec<&str> = content.lines().take(line_limit).collect();
        return Some(SourceSnippet {
            path: relative.to_string_lossy().to_string(),
            content: head.join("\n"),
            truncated: total > line_limit,
        });
    }
    None
}
