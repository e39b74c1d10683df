use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the ledger.
///
/// Wraps `LedgerDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so the poll and monitor loops
/// never stall a runtime worker on SQLite I/O.
#[derive(Clone)]
pub struct LedgerHandle {
    inner: Arc<std::sync::Mutex<LedgerDb>>,
}

impl LedgerHandle {
    pub fn new(db: LedgerDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the ledger on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&LedgerDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("Ledger lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("Ledger task panicked")?
    }

    pub async fn lookup(&self, issue_id: &str) -> Result<LookupOutcome> {
        let issue_id = issue_id.to_string();
        self.call(move |db| db.lookup(&issue_id)).await
    }

    pub async fn record(&self, outcome: IssueOutcome) -> Result<ProcessedIssue> {
        self.call(move |db| db.record(&outcome)).await
    }

    pub async fn is_comment_processed(
        &self,
        change_request_id: &str,
        comment_id: &str,
    ) -> Result<bool> {
        let change_request_id = change_request_id.to_string();
        let comment_id = comment_id.to_string();
        self.call(move |db| db.is_comment_processed(&change_request_id, &comment_id))
            .await
    }

    pub async fn record_comment(&self, comment: ProcessedComment) -> Result<bool> {
        self.call(move |db| db.record_comment(&comment)).await
    }

    pub async fn mark_change_request_closed(&self, url: &str, state: &str) -> Result<bool> {
        let url = url.to_string();
        let state = state.to_string();
        self.call(move |db| db.mark_change_request_closed(&url, &state))
            .await
    }
}

pub struct LedgerDb {
    conn: Connection,
}

impl LedgerDb {
    /// Open (or create) the ledger at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create ledger directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory ledger (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS processed_issues (
                    issue_id TEXT PRIMARY KEY,
                    module TEXT NOT NULL,
                    title TEXT,
                    status TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 1,
                    pr_url TEXT,
                    error_message TEXT,
                    first_processed_at INTEGER NOT NULL,
                    last_processed_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS processed_comments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    change_request_id TEXT NOT NULL,
                    comment_id TEXT NOT NULL,
                    comment_type TEXT NOT NULL,
                    body TEXT NOT NULL DEFAULT '',
                    processed_at INTEGER NOT NULL,
                    action_taken TEXT NOT NULL,
                    UNIQUE(change_request_id, comment_id)
                );

                CREATE TABLE IF NOT EXISTS closed_change_requests (
                    url TEXT PRIMARY KEY,
                    state TEXT NOT NULL,
                    closed_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_processed_issues_status ON processed_issues(status);
                CREATE INDEX IF NOT EXISTS idx_processed_comments_cr ON processed_comments(change_request_id);
                ",
            )
            .context("Failed to create ledger tables")?;
        Ok(())
    }

    // ── Issues ────────────────────────────────────────────────────────

    pub fn lookup(&self, issue_id: &str) -> Result<LookupOutcome> {
        let row: Option<(String, u32)> = self
            .conn
            .query_row(
                "SELECT status, attempts FROM processed_issues WHERE issue_id = ?1",
                params![issue_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to look up issue")?;

        match row {
            None => Ok(LookupOutcome::Unseen),
            Some((status, attempts)) => {
                let status: IssueStatus = status
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!(e))?;
                Ok(LookupOutcome::classify(status, attempts))
            }
        }
    }

    /// Upsert the latest outcome. The first write sets `attempts = 1`; later
    /// writes increment it and overwrite status, URL and error with the most
    /// recent diagnosis. `first_processed_at`, module and title are kept.
    pub fn record(&self, outcome: &IssueOutcome) -> Result<ProcessedIssue> {
        let now = Utc::now().timestamp_millis();
        self.conn
            .execute(
                "INSERT INTO processed_issues
                    (issue_id, module, title, status, attempts, pr_url, error_message, first_processed_at, last_processed_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?7)
                 ON CONFLICT(issue_id) DO UPDATE SET
                    status = excluded.status,
                    attempts = processed_issues.attempts + 1,
                    pr_url = excluded.pr_url,
                    error_message = excluded.error_message,
                    last_processed_at = excluded.last_processed_at",
                params![
                    outcome.issue_id,
                    outcome.module,
                    outcome.title,
                    outcome.status.as_str(),
                    outcome.change_request_url,
                    outcome.error_message,
                    now,
                ],
            )
            .context("Failed to record processed issue")?;
        self.get(&outcome.issue_id)?
            .context("Processed issue not found after upsert")
    }

    pub fn get(&self, issue_id: &str) -> Result<Option<ProcessedIssue>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE issue_id = ?1", SELECT_ISSUE))
            .context("Failed to prepare get")?;
        let mut rows = stmt
            .query_map(params![issue_id], map_issue_row)
            .context("Failed to query processed issue")?;
        match rows.next() {
            Some(row) => Ok(Some(
                row.context("Failed to read processed issue row")?
                    .into_issue()?,
            )),
            None => Ok(None),
        }
    }

    /// Rows that carry a change request the PR monitor should watch.
    /// Requests already seen merged or closed are left out.
    pub fn tracked_change_requests(&self) -> Result<Vec<ProcessedIssue>> {
        self.query_issues(
            &format!(
                "{} WHERE pr_url IS NOT NULL AND status IN ('success', 'updated')
                   AND pr_url NOT IN (SELECT url FROM closed_change_requests)
                 ORDER BY last_processed_at DESC",
                SELECT_ISSUE
            ),
            params![],
        )
    }

    pub fn recent_errors(&self, limit: u32) -> Result<Vec<ProcessedIssue>> {
        self.query_issues(
            &format!(
                "{} WHERE status IN ('error', 'failed')
                 ORDER BY last_processed_at DESC LIMIT ?1",
                SELECT_ISSUE
            ),
            params![limit],
        )
    }

    pub fn stats(&self) -> Result<LedgerStats> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM processed_issues GROUP BY status")
            .context("Failed to prepare stats")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .context("Failed to query stats")?;
        let mut stats = LedgerStats::default();
        for row in rows {
            let (status, count) = row.context("Failed to read stats row")?;
            let count = count.max(0) as u64;
            stats.total += count;
            stats.by_status.insert(status, count);
        }
        Ok(stats)
    }

    /// Remove every processed issue. Returns the number of rows deleted.
    pub fn clear(&self) -> Result<usize> {
        self.conn
            .execute("DELETE FROM processed_issues", [])
            .context("Failed to clear processed issues")
    }

    fn query_issues<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<ProcessedIssue>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare query")?;
        let rows = stmt
            .query_map(params, map_issue_row)
            .context("Failed to query processed issues")?;
        let mut issues = Vec::new();
        for row in rows {
            issues.push(row.context("Failed to read processed issue row")?.into_issue()?);
        }
        Ok(issues)
    }

    /// Remember that a change request reached a terminal state. Returns
    /// false if it was already recorded.
    pub fn mark_change_request_closed(&self, url: &str, state: &str) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO closed_change_requests (url, state, closed_at)
                 VALUES (?1, ?2, ?3)",
                params![url, state, Utc::now().timestamp_millis()],
            )
            .context("Failed to record closed change request")?;
        Ok(inserted > 0)
    }

    // ── Comments ──────────────────────────────────────────────────────

    pub fn is_comment_processed(&self, change_request_id: &str, comment_id: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM processed_comments WHERE change_request_id = ?1 AND comment_id = ?2",
                params![change_request_id, comment_id],
                |row| row.get(0),
            )
            .context("Failed to check processed comment")?;
        Ok(count > 0)
    }

    /// Record an actioned comment. Returns false if it was already recorded.
    pub fn record_comment(&self, comment: &ProcessedComment) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO processed_comments
                    (change_request_id, comment_id, comment_type, body, processed_at, action_taken)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    comment.change_request_id,
                    comment.comment_id,
                    comment.comment_type,
                    comment.body,
                    comment.processed_at.timestamp_millis(),
                    comment.action_taken.as_str(),
                ],
            )
            .context("Failed to record processed comment")?;
        Ok(inserted > 0)
    }
}

const SELECT_ISSUE: &str = "SELECT issue_id, module, title, status, attempts, pr_url, error_message, first_processed_at, last_processed_at FROM processed_issues";

/// Raw row before status/timestamp parsing.
struct IssueRow {
    issue_id: String,
    module: String,
    title: Option<String>,
    status: String,
    attempts: u32,
    pr_url: Option<String>,
    error_message: Option<String>,
    first_processed_at: i64,
    last_processed_at: i64,
}

fn map_issue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IssueRow> {
    Ok(IssueRow {
        issue_id: row.get(0)?,
        module: row.get(1)?,
        title: row.get(2)?,
        status: row.get(3)?,
        attempts: row.get(4)?,
        pr_url: row.get(5)?,
        error_message: row.get(6)?,
        first_processed_at: row.get(7)?,
        last_processed_at: row.get(8)?,
    })
}

impl IssueRow {
    fn into_issue(self) -> Result<ProcessedIssue> {
        Ok(ProcessedIssue {
            issue_id: self.issue_id,
            module: self.module,
            title: self.title,
            status: self.status.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            attempts: self.attempts,
            change_request_url: self.pr_url,
            error_message: self.error_message,
            first_seen_at: millis_to_datetime(self.first_processed_at)?,
            last_seen_at: millis_to_datetime(self.last_processed_at)?,
        })
    }
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .with_context(|| format!("Invalid timestamp in ledger: {}", millis))
}
