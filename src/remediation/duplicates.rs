//! Duplicate Finder: keyword overlap against open and recently closed
//! change requests. Heuristic by nature; one keyword hit is a match.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};

use crate::agent::IssueAnalysis;
use crate::hosting::{ChangeRequest, ChangeRequestClient, ChangeRequestState};
use crate::tracker::Issue;

/// Minimum length of title and root-cause words kept as keywords.
pub const MIN_KEYWORD_LEN: usize = 5;
const ROOT_CAUSE_WORDS: usize = 3;
const STOP_WORDS: &[&str] = &["error", "undefined", "null", "function", "issue", "fixed"];

#[derive(Debug, Clone, PartialEq)]
pub enum DuplicateMatch {
    None,
    /// An open request overlaps; the fix revises it in place.
    Open {
        change_request: ChangeRequest,
        keyword: String,
    },
    /// A recently closed request overlaps; a fresh request is still opened.
    Closed {
        change_request: ChangeRequest,
        keyword: String,
    },
}

fn long_words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '_'))
        .filter(|w| w.chars().count() >= MIN_KEYWORD_LEN)
        .map(str::to_lowercase)
}

/// Keywords from the issue title, the first words of the root cause, the
/// error type, and basenames of the files in the proposed fix.
pub fn extract_keywords(issue: &Issue, analysis: &IssueAnalysis) -> Vec<String> {
    let mut keywords: Vec<String> = long_words(&issue.title).collect();
    keywords.extend(long_words(&analysis.root_cause).take(ROOT_CAUSE_WORDS));
    if let Some(error_type) = &issue.metadata.error_type {
        keywords.push(error_type.to_lowercase());
    }
    for path in analysis.file_paths() {
        if let Some(name) = Path::new(path).file_name().and_then(|n| n.to_str()) {
            keywords.push(name.to_lowercase());
        }
    }

    let mut unique = Vec::new();
    for keyword in keywords {
        if keyword.is_empty() || STOP_WORDS.contains(&keyword.as_str()) {
            continue;
        }
        if !unique.contains(&keyword) {
            unique.push(keyword);
        }
    }
    unique
}

/// First keyword found in the request's title or body.
pub fn matching_keyword(change_request: &ChangeRequest, keywords: &[String]) -> Option<String> {
    let text = format!("{} {}", change_request.title, change_request.body).to_lowercase();
    keywords.iter().find(|k| text.contains(k.as_str())).cloned()
}

pub struct DuplicateSearch<'a> {
    pub hosting: &'a dyn ChangeRequestClient,
    pub repo: &'a Path,
    pub list_limit: u32,
    pub lookback: Duration,
    pub now: DateTime<Utc>,
}

impl DuplicateSearch<'_> {
    /// Search open requests, then those closed within the lookback window.
    /// Listing failures are logged and count as no match.
    pub async fn find(&self, keywords: &[String]) -> DuplicateMatch {
        if keywords.is_empty() {
            return DuplicateMatch::None;
        }

        match self
            .hosting
            .list_change_requests(self.repo, ChangeRequestState::Open, self.list_limit)
            .await
        {
            Ok(open) => {
                for cr in open {
                    if let Some(keyword) = matching_keyword(&cr, keywords) {
                        return DuplicateMatch::Open {
                            change_request: cr,
                            keyword,
                        };
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "Could not list open change requests");
                return DuplicateMatch::None;
            }
        }

        match self
            .hosting
            .list_change_requests(self.repo, ChangeRequestState::Closed, self.list_limit)
            .await
        {
            Ok(closed) => {
                let cutoff = self.now - self.lookback;
                for cr in closed {
                    if !cr.closed_at.is_some_and(|at| at > cutoff) {
                        continue;
                    }
                    if let Some(keyword) = matching_keyword(&cr, keywords) {
                        return DuplicateMatch::Closed {
                            change_request: cr,
                            keyword,
                        };
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "Could not list closed change requests");
            }
        }

        DuplicateMatch::None
    }
}
