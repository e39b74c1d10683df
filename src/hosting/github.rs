use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{
    ChangeRequest, ChangeRequestClient, ChangeRequestState, CommentKind, NewChangeRequest,
    ReviewComment,
};
use crate::process;

const PR_FIELDS: &str = "number,title,url,body,headRefName,state,closedAt";

/// `ChangeRequestClient` backed by the GitHub CLI (`gh`), run inside the
/// project checkout so the repository is inferred from its remote.
pub struct GhCli {
    program: String,
    timeout: Duration,
}

impl GhCli {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: "gh".to_string(),
            timeout,
        }
    }

    pub fn with_program(program: &str, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            timeout,
        }
    }

    async fn gh(&self, repo: &Path, args: &[&str]) -> Result<String> {
        let out = process::run(&self.program, args, repo, self.timeout).await?;
        Ok(out.stdout)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhPullRequest {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    head_ref_name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    closed_at: Option<DateTime<Utc>>,
}

impl From<GhPullRequest> for ChangeRequest {
    fn from(pr: GhPullRequest) -> Self {
        let state = match pr.state.to_ascii_uppercase().as_str() {
            "MERGED" => ChangeRequestState::Merged,
            "CLOSED" => ChangeRequestState::Closed,
            _ => ChangeRequestState::Open,
        };
        ChangeRequest {
            number: pr.number,
            title: pr.title,
            url: pr.url,
            body: pr.body.unwrap_or_default(),
            branch: pr.head_ref_name,
            state,
            closed_at: pr.closed_at,
        }
    }
}

#[derive(Deserialize, Default)]
struct GhAuthor {
    #[serde(default)]
    login: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhComment {
    id: String,
    #[serde(default)]
    author: Option<GhAuthor>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhReview {
    id: String,
    #[serde(default)]
    author: Option<GhAuthor>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    submitted_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Default)]
struct GhConversation {
    #[serde(default)]
    comments: Vec<GhComment>,
    #[serde(default)]
    reviews: Vec<GhReview>,
}

/// Inline review comment from the REST API (snake_case fields).
#[derive(Deserialize)]
struct GhInlineComment {
    id: u64,
    #[serde(default)]
    user: Option<GhAuthor>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

fn login(author: Option<GhAuthor>) -> String {
    author.map(|a| a.login).unwrap_or_default()
}

fn parse_conversation(json: &str) -> Result<Vec<ReviewComment>> {
    let conversation: GhConversation =
        serde_json::from_str(json).context("Failed to parse gh pr view output")?;
    let mut comments: Vec<ReviewComment> = conversation
        .comments
        .into_iter()
        .map(|c| ReviewComment {
            id: c.id,
            author: login(c.author),
            body: c.body,
            created_at: c.created_at,
            kind: CommentKind::Comment,
        })
        .collect();
    comments.extend(
        conversation
            .reviews
            .into_iter()
            .filter(|r| !r.body.trim().is_empty())
            .map(|r| ReviewComment {
                id: r.id,
                author: login(r.author),
                body: r.body,
                created_at: r.submitted_at,
                kind: CommentKind::Review,
            }),
    );
    Ok(comments)
}

fn parse_inline_comments(json: &str) -> Result<Vec<ReviewComment>> {
    let inline: Vec<GhInlineComment> =
        serde_json::from_str(json).context("Failed to parse review comments")?;
    Ok(inline
        .into_iter()
        .map(|c| ReviewComment {
            id: c.id.to_string(),
            author: login(c.user),
            body: c.body,
            created_at: c.created_at,
            kind: CommentKind::ReviewThread,
        })
        .collect())
}

/// Parse the pull-request number from a GitHub PR URL.
///
/// - `https://github.com/owner/repo/pull/123`
/// - `https://github.com/owner/repo/pull/123/files`
pub fn parse_change_request_number(url: &str) -> Option<u64> {
    let rest = url.strip_prefix("https://")?;
    let parts: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
    // github.com / owner / repo / pull / N [/ ...]
    if parts.len() >= 5 && parts[3] == "pull" && !parts[1].is_empty() && !parts[2].is_empty() {
        parts[4].parse().ok()
    } else {
        None
    }
}

#[async_trait]
impl ChangeRequestClient for GhCli {
    async fn list_change_requests(
        &self,
        repo: &Path,
        state: ChangeRequestState,
        limit: u32,
    ) -> Result<Vec<ChangeRequest>> {
        let limit = limit.to_string();
        let state_arg = match state {
            ChangeRequestState::Open => "open",
            ChangeRequestState::Closed => "closed",
            ChangeRequestState::Merged => "merged",
        };
        let stdout = self
            .gh(
                repo,
                &["pr", "list", "--state", state_arg, "--json", PR_FIELDS, "--limit", &limit],
            )
            .await
            .context("Failed to list pull requests")?;
        let prs: Vec<GhPullRequest> =
            serde_json::from_str(&stdout).context("Failed to parse gh pr list output")?;
        Ok(prs.into_iter().map(ChangeRequest::from).collect())
    }

    async fn create_change_request(&self, repo: &Path, request: &NewChangeRequest) -> Result<String> {
        let mut args = vec![
            "pr",
            "create",
            "--title",
            request.title.as_str(),
            "--body-file",
            "-",
            "--base",
            request.base.as_str(),
            "--head",
            request.head.as_str(),
        ];
        if request.draft {
            args.push("--draft");
        }
        let out = process::run_with_input(
            &self.program,
            &args,
            repo,
            Some(&request.body),
            self.timeout,
        )
        .await
        .context("Failed to create pull request")?;

        // gh prints progress lines before the URL; the URL is the last line.
        let url = out
            .stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| l.starts_with("https://"))
            .map(str::to_string)
            .context("gh pr create did not print a pull request URL")?;
        Ok(url)
    }

    async fn get_change_request(&self, repo: &Path, number: u64) -> Result<ChangeRequest> {
        let number = number.to_string();
        let stdout = self
            .gh(repo, &["pr", "view", &number, "--json", PR_FIELDS])
            .await
            .with_context(|| format!("Failed to read pull request #{}", number))?;
        let pr: GhPullRequest =
            serde_json::from_str(&stdout).context("Failed to parse gh pr view output")?;
        Ok(pr.into())
    }

    async fn list_comments(&self, repo: &Path, number: u64) -> Result<Vec<ReviewComment>> {
        let number_arg = number.to_string();
        let stdout = self
            .gh(repo, &["pr", "view", &number_arg, "--json", "comments,reviews"])
            .await
            .with_context(|| format!("Failed to read comments of pull request #{}", number))?;
        let mut comments = parse_conversation(&stdout)?;

        let endpoint = format!("repos/{{owner}}/{{repo}}/pulls/{}/comments", number);
        match self.gh(repo, &["api", &endpoint]).await {
            Ok(stdout) => comments.extend(parse_inline_comments(&stdout)?),
            Err(e) => {
                tracing::warn!(change_request = number, error = %format!("{:#}", e), "Could not read inline review comments");
            }
        }
        Ok(comments)
    }

    async fn post_comment(&self, repo: &Path, number: u64, body: &str) -> Result<()> {
        let number_arg = number.to_string();
        process::run_with_input(
            &self.program,
            &["pr", "comment", &number_arg, "--body-file", "-"],
            repo,
            Some(body),
            self.timeout,
        )
        .await
        .with_context(|| format!("Failed to comment on pull request #{}", number))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_change_request_number() {
        assert_eq!(
            parse_change_request_number("https://github.com/Freegle/iznik-server/pull/123"),
            Some(123)
        );
        assert_eq!(
            parse_change_request_number("https://github.com/o/r/pull/7/files"),
            Some(7)
        );
        assert_eq!(parse_change_request_number("https://github.com/o/r/issues/7"), None);
        assert_eq!(parse_change_request_number("github.com/o/r/pull/7"), None);
        assert_eq!(parse_change_request_number("https://github.com/o/r/pull/abc"), None);
    }

    #[test]
    fn test_pull_request_state_mapping() {
        let pr: GhPullRequest = serde_json::from_value(serde_json::json!({
            "number": 5,
            "title": "Fix: null session",
            "url": "https://github.com/o/r/pull/5",
            "body": null,
            "headRefName": "sentry-auto-fix-1700000000000",
            "state": "MERGED",
            "closedAt": "2026-03-01T10:00:00Z"
        }))
        .unwrap();
        let cr = ChangeRequest::from(pr);
        assert_eq!(cr.state, ChangeRequestState::Merged);
        assert_eq!(cr.body, "");
        assert_eq!(cr.branch, "sentry-auto-fix-1700000000000");
        assert!(cr.closed_at.is_some());
    }

    #[test]
    fn test_parse_conversation_skips_empty_reviews() {
        let json = r#"{
            "comments": [
                {"id": "IC_1", "author": {"login": "alice"}, "body": "Rename this", "createdAt": "2026-03-01T10:00:00Z"}
            ],
            "reviews": [
                {"id": "PRR_1", "author": {"login": "bob"}, "body": "", "submittedAt": "2026-03-01T11:00:00Z"},
                {"id": "PRR_2", "author": {"login": "bob"}, "body": "Needs a test", "submittedAt": "2026-03-01T12:00:00Z"}
            ]
        }"#;
        let comments = parse_conversation(json).unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].author, "alice");
        assert_eq!(comments[0].kind, CommentKind::Comment);
        assert_eq!(comments[1].id, "PRR_2");
        assert_eq!(comments[1].kind, CommentKind::Review);
    }

    #[test]
    fn test_parse_inline_comments() {
        let json = r#"[{"id": 991, "user": {"login": "carol"}, "body": "off by one", "created_at": "2026-03-02T09:00:00Z"}]"#;
        let comments = parse_inline_comments(json).unwrap();
        assert_eq!(comments[0].id, "991");
        assert_eq!(comments[0].kind, CommentKind::ReviewThread);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_create_change_request_reads_url_from_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-gh");
        std::fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\necho 'Creating pull request for branch'\necho 'https://github.com/o/r/pull/42'\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let gh = GhCli::with_program(script.to_str().unwrap(), Duration::from_secs(5));
        let url = gh
            .create_change_request(
                dir.path(),
                &NewChangeRequest {
                    title: "Fix: null".into(),
                    body: "body".into(),
                    base: "master".into(),
                    head: "sentry-auto-fix-1".into(),
                    draft: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(url, "https://github.com/o/r/pull/42");
    }
}
