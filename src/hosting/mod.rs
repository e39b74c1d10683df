//! Code-hosting seam: change-request listing, creation and comments.

pub mod github;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use github::{GhCli, parse_change_request_number};

/// Prefix of every comment the orchestrator posts, so the PR Monitor can
/// tell its own comments from a reviewer's.
pub const BOT_COMMENT_PREFIX: &str = "🤖 **Autofix**";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeRequestState {
    Open,
    Closed,
    Merged,
}

impl ChangeRequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Merged => "merged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub number: u64,
    pub title: String,
    pub url: String,
    pub body: String,
    pub branch: String,
    pub state: ChangeRequestState,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewChangeRequest {
    pub title: String,
    pub body: String,
    pub base: String,
    pub head: String,
    pub draft: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentKind {
    /// Conversation comment on the change request.
    Comment,
    /// Body of a submitted review.
    Review,
    /// Inline comment on a line of the diff.
    ReviewThread,
}

impl CommentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Comment => "comment",
            Self::Review => "review",
            Self::ReviewThread => "review_thread",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewComment {
    pub id: String,
    pub author: String,
    pub body: String,
    pub created_at: Option<DateTime<Utc>>,
    pub kind: CommentKind,
}

impl ReviewComment {
    pub fn is_from_bot(&self) -> bool {
        self.body.trim_start().starts_with(BOT_COMMENT_PREFIX)
    }
}

#[async_trait]
pub trait ChangeRequestClient: Send + Sync {
    /// Change requests of the repository checked out at `repo`, newest first.
    async fn list_change_requests(
        &self,
        repo: &Path,
        state: ChangeRequestState,
        limit: u32,
    ) -> Result<Vec<ChangeRequest>>;

    /// Open a change request and return its URL.
    async fn create_change_request(&self, repo: &Path, request: &NewChangeRequest) -> Result<String>;

    async fn get_change_request(&self, repo: &Path, number: u64) -> Result<ChangeRequest>;

    async fn list_comments(&self, repo: &Path, number: u64) -> Result<Vec<ReviewComment>>;

    async fn post_comment(&self, repo: &Path, number: u64, body: &str) -> Result<()>;
}
