use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{Event, Issue, IssueDetail, IssueTracker, Note};

/// Sentry REST client authenticated with a bearer token.
///
/// Every request is followed by a short pause (`api_delay`) to stay well
/// under the API's rate limits during a sweep.
pub struct SentryClient {
    http: reqwest::Client,
    base_url: String,
    org_slug: String,
    token: String,
    api_delay: Duration,
}

impl SentryClient {
    pub fn new(
        base_url: &str,
        org_slug: &str,
        token: &str,
        request_timeout: Duration,
        api_delay: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("autofix/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            org_slug: org_slug.to_string(),
            token: token.to_string(),
            api_delay,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/0/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = self.url(path);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", url))?;
        self.pace().await;
        let resp = resp
            .error_for_status()
            .with_context(|| format!("Sentry returned an error for {}", url))?;
        resp.json::<T>()
            .await
            .with_context(|| format!("Failed to parse Sentry response from {}", url))
    }

    async fn pace(&self) {
        if !self.api_delay.is_zero() {
            tokio::time::sleep(self.api_delay).await;
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNote {
    id: String,
    date_created: DateTime<Utc>,
    #[serde(default)]
    data: RawNoteData,
}

#[derive(Deserialize, Default)]
struct RawNoteData {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl IssueTracker for SentryClient {
    async fn list_unresolved_issues(&self, project_slug: &str, window: &str) -> Result<Vec<Issue>> {
        let path = format!("projects/{}/{}/issues/", self.org_slug, project_slug);
        self.get_json(&path, &[("query", "is:unresolved"), ("statsPeriod", window)])
            .await
            .with_context(|| format!("Failed to list issues for project {}", project_slug))
    }

    async fn get_issue_detail(&self, issue_id: &str) -> Result<IssueDetail> {
        let issue: Issue = self
            .get_json(&format!("issues/{}/", issue_id), &[])
            .await
            .with_context(|| format!("Failed to fetch issue details for {}", issue_id))?;

        // The latest event only enriches the context; its absence is not fatal.
        let latest_event = match self
            .get_json::<Event>(&format!("issues/{}/events/latest/", issue_id), &[])
            .await
        {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(issue_id, error = %format!("{:#}", e), "Could not fetch latest event");
                None
            }
        };

        Ok(IssueDetail {
            issue,
            latest_event,
        })
    }

    async fn list_notes(&self, issue_id: &str) -> Result<Vec<Note>> {
        let raw: Vec<RawNote> = self
            .get_json(&format!("issues/{}/notes/", issue_id), &[])
            .await
            .with_context(|| format!("Failed to fetch notes for issue {}", issue_id))?;
        Ok(raw
            .into_iter()
            .map(|n| Note {
                id: n.id,
                date_created: n.date_created,
                text: n.data.text,
            })
            .collect())
    }

    async fn add_note(&self, issue_id: &str, text: &str) -> Result<()> {
        let url = self.url(&format!("issues/{}/notes/", issue_id));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .with_context(|| format!("Failed to post note to issue {}", issue_id))?;
        self.pace().await;
        let status = resp.status();
        if status != StatusCode::CREATED && !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Sentry rejected note for issue {}: {} {}", issue_id, status, body);
        }
        Ok(())
    }
}
