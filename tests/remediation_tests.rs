//! Pipeline scenarios driven through in-memory collaborators.
//!
//! The tracker, code host, agent and checkout are fakes; the ledger is a
//! real in-memory SQLite database and patches are written to a real
//! temporary directory.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::watch;

use autofix::agent::CodeAgent;
use autofix::config::{AutofixConfig, ProjectConfig};
use autofix::errors::AgentError;
use autofix::hosting::{
    BOT_COMMENT_PREFIX, ChangeRequest, ChangeRequestClient, ChangeRequestState, CommentKind,
    NewChangeRequest, ReviewComment,
};
use autofix::ledger::{
    IssueOutcome, IssueStatus, LedgerDb, LedgerHandle, LookupOutcome, ProcessedIssue,
};
use autofix::remediation::lock::{IN_PROGRESS_MARKER, marker_text};
use autofix::remediation::{
    IssueDisposition, Services, WorkerContext, process_issue, run_cycle, run_sweep,
};
use autofix::tracker::{Event, Issue, IssueDetail, IssueMetadata, IssueTracker, Note};
use autofix::vcs::{BranchManager, CheckoutProvider};

// =============================================================================
// Fakes
// =============================================================================

#[derive(Default)]
struct FakeTracker {
    issues: Mutex<HashMap<String, Vec<Issue>>>,
    notes: Mutex<HashMap<String, Vec<Note>>>,
    detail_calls: AtomicUsize,
}

impl FakeTracker {
    fn add_issue(&self, project_slug: &str, issue: Issue) {
        self.issues
            .lock()
            .unwrap()
            .entry(project_slug.to_string())
            .or_default()
            .push(issue);
    }

    fn push_note(&self, issue_id: &str, text: String, age: Duration) {
        let mut notes = self.notes.lock().unwrap();
        let list = notes.entry(issue_id.to_string()).or_default();
        list.push(Note {
            id: format!("n{}", list.len() + 1),
            date_created: Utc::now() - age,
            text,
        });
    }

    fn notes_for(&self, issue_id: &str) -> Vec<String> {
        self.notes
            .lock()
            .unwrap()
            .get(issue_id)
            .map(|n| n.iter().map(|n| n.text.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl IssueTracker for FakeTracker {
    async fn list_unresolved_issues(&self, project_slug: &str, _window: &str) -> Result<Vec<Issue>> {
        Ok(self
            .issues
            .lock()
            .unwrap()
            .get(project_slug)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_issue_detail(&self, issue_id: &str) -> Result<IssueDetail> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        let issue = self
            .issues
            .lock()
            .unwrap()
            .values()
            .flatten()
            .find(|i| i.id == issue_id)
            .cloned();
        let Some(issue) = issue else {
            bail!("Issue {} not found", issue_id);
        };
        let event: Event = serde_json::from_value(json!({
            "eventID": "e1",
            "entries": [{"type": "exception", "data": {"values": [{
                "type": "TypeError",
                "value": "Cannot read property getId of null",
                "stacktrace": {"frames": [
                    {"filename": "include/Session.php", "function": "getUser", "lineNo": 3, "inApp": true}
                ]}
            }]}}]
        }))?;
        Ok(IssueDetail {
            issue,
            latest_event: Some(event),
        })
    }

    async fn list_notes(&self, issue_id: &str) -> Result<Vec<Note>> {
        Ok(self
            .notes
            .lock()
            .unwrap()
            .get(issue_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_note(&self, issue_id: &str, text: &str) -> Result<()> {
        self.push_note(issue_id, text.to_string(), Duration::zero());
        Ok(())
    }
}

#[derive(Default)]
struct FakeHosting {
    open: Mutex<Vec<ChangeRequest>>,
    closed: Mutex<Vec<ChangeRequest>>,
    created: Mutex<Vec<NewChangeRequest>>,
    posted: Mutex<Vec<(u64, String)>>,
    comments: Mutex<HashMap<u64, Vec<ReviewComment>>>,
    fail_post: AtomicBool,
    /// When set, every reply notes whether (ledger key, comment id) was
    /// already recorded at the time it was posted.
    reply_check: Mutex<Option<(LedgerHandle, String, String)>>,
    recorded_at_reply: Mutex<Vec<bool>>,
}

impl FakeHosting {
    fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    fn posted(&self) -> Vec<(u64, String)> {
        self.posted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChangeRequestClient for FakeHosting {
    async fn list_change_requests(
        &self,
        _repo: &Path,
        state: ChangeRequestState,
        limit: u32,
    ) -> Result<Vec<ChangeRequest>> {
        let list = match state {
            ChangeRequestState::Open => self.open.lock().unwrap().clone(),
            _ => self.closed.lock().unwrap().clone(),
        };
        Ok(list.into_iter().take(limit as usize).collect())
    }

    async fn create_change_request(&self, _repo: &Path, request: &NewChangeRequest) -> Result<String> {
        let mut created = self.created.lock().unwrap();
        created.push(request.clone());
        let number = 100 + created.len() as u64;
        let url = format!("https://github.com/freegle/iznik-server/pull/{}", number);
        self.open.lock().unwrap().push(ChangeRequest {
            number,
            title: request.title.clone(),
            url: url.clone(),
            body: request.body.clone(),
            branch: request.head.clone(),
            state: ChangeRequestState::Open,
            closed_at: None,
        });
        Ok(url)
    }

    async fn get_change_request(&self, _repo: &Path, number: u64) -> Result<ChangeRequest> {
        let open = self.open.lock().unwrap();
        let closed = self.closed.lock().unwrap();
        match open.iter().chain(closed.iter()).find(|cr| cr.number == number) {
            Some(cr) => Ok(cr.clone()),
            None => bail!("Change request {} not found", number),
        }
    }

    async fn list_comments(&self, _repo: &Path, number: u64) -> Result<Vec<ReviewComment>> {
        Ok(self
            .comments
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .unwrap_or_default())
    }

    async fn post_comment(&self, _repo: &Path, number: u64, body: &str) -> Result<()> {
        let check = self.reply_check.lock().unwrap().clone();
        if let Some((ledger, key, comment_id)) = check {
            let recorded = ledger.is_comment_processed(&key, &comment_id).await?;
            self.recorded_at_reply.lock().unwrap().push(recorded);
        }
        if self.fail_post.load(Ordering::SeqCst) {
            bail!("GraphQL: was submitted too quickly");
        }
        self.posted.lock().unwrap().push((number, body.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct FakeAgent {
    answers: Mutex<VecDeque<String>>,
    asks: AtomicUsize,
    edits: AtomicUsize,
    /// File written (relative path, content) when asked to edit.
    edit_write: Mutex<Option<(String, String)>>,
    /// File written (relative path, content) while answering a question.
    ask_write: Mutex<Option<(String, String)>>,
}

impl FakeAgent {
    fn answer(&self, text: String) {
        self.answers.lock().unwrap().push_back(text);
    }

    fn asks(&self) -> usize {
        self.asks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeAgent for FakeAgent {
    async fn ask(&self, _prompt: &str, dir: &Path) -> Result<String, AgentError> {
        self.asks.fetch_add(1, Ordering::SeqCst);
        if let Some((path, content)) = self.ask_write.lock().unwrap().clone() {
            fs::write(dir.join(path), content).unwrap();
        }
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(AgentError::NoStructuredOutput)
    }

    async fn edit(&self, _prompt: &str, dir: &Path) -> Result<String, AgentError> {
        self.edits.fetch_add(1, Ordering::SeqCst);
        if let Some((path, content)) = self.edit_write.lock().unwrap().clone() {
            fs::write(dir.join(path), content).unwrap();
        }
        Ok("Done".to_string())
    }
}

type Tree = BTreeMap<PathBuf, String>;

fn snapshot(root: &Path) -> Tree {
    let mut files = Tree::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_path_buf();
                files.insert(rel, fs::read_to_string(&path).unwrap());
            }
        }
    }
    files
}

fn materialize(root: &Path, tree: &Tree) {
    for rel in snapshot(root).keys() {
        fs::remove_file(root.join(rel)).unwrap();
    }
    for (rel, content) in tree {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

struct VcsState {
    current: String,
    /// Committed tree per branch; local and remote are not distinguished.
    trees: HashMap<String, Tree>,
    commits: Vec<(String, String)>,
    pushes: Vec<(String, bool)>,
    fail_push: bool,
}

/// A checkout whose branches are in-memory trees materialized into a real
/// directory on switch.
struct FakeVcs {
    root: PathBuf,
    trunk: String,
    state: Mutex<VcsState>,
}

impl FakeVcs {
    fn new(root: &Path) -> Self {
        let mut trees = HashMap::new();
        trees.insert("master".to_string(), snapshot(root));
        Self {
            root: root.to_path_buf(),
            trunk: "master".to_string(),
            state: Mutex::new(VcsState {
                current: "master".to_string(),
                trees,
                commits: Vec::new(),
                pushes: Vec::new(),
                fail_push: false,
            }),
        }
    }

    fn add_branch(&self, branch: &str, tree: Tree) {
        self.state
            .lock()
            .unwrap()
            .trees
            .insert(branch.to_string(), tree);
    }

    fn switch_to(&self, branch: &str) {
        let mut state = self.state.lock().unwrap();
        let tree = state.trees[branch].clone();
        materialize(&self.root, &tree);
        state.current = branch.to_string();
    }

    fn current(&self) -> String {
        self.state.lock().unwrap().current.clone()
    }

    fn tree(&self, branch: &str) -> Option<Tree> {
        self.state.lock().unwrap().trees.get(branch).cloned()
    }

    fn pushes(&self) -> Vec<(String, bool)> {
        self.state.lock().unwrap().pushes.clone()
    }

    fn commits(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().commits.clone()
    }

    fn set_fail_push(&self, fail: bool) {
        self.state.lock().unwrap().fail_push = fail;
    }

    fn materialize_branch(&self, state: &mut VcsState, branch: &str) -> Result<()> {
        let Some(tree) = state.trees.get(branch).cloned() else {
            bail!("Unknown branch {}", branch);
        };
        materialize(&self.root, &tree);
        state.current = branch.to_string();
        Ok(())
    }
}

#[async_trait]
impl BranchManager for FakeVcs {
    fn repo_path(&self) -> &Path {
        &self.root
    }

    fn trunk(&self) -> &str {
        &self.trunk
    }

    async fn current_branch(&self) -> Result<String> {
        Ok(self.current())
    }

    async fn checkout(&self, branch: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.materialize_branch(&mut state, branch)
    }

    async fn create_branch_from_trunk(&self, branch: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.trees.contains_key(branch) {
            bail!("Branch {} already exists", branch);
        }
        let trunk = state.trees[&self.trunk].clone();
        state.trees.insert(branch.to_string(), trunk);
        self.materialize_branch(&mut state, branch)
    }

    async fn reset_branch_to_trunk(&self, branch: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.trees.contains_key(branch) {
            bail!("Unknown branch {}", branch);
        }
        let trunk = state.trees[&self.trunk].clone();
        state.trees.insert(branch.to_string(), trunk);
        self.materialize_branch(&mut state, branch)
    }

    async fn checkout_remote_branch(&self, branch: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.materialize_branch(&mut state, branch)
    }

    async fn has_changes(&self) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(snapshot(&self.root) != state.trees[&state.current])
    }

    async fn commit_paths(&self, paths: &[PathBuf], message: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let current = state.current.clone();
        for path in paths {
            let content = fs::read_to_string(self.root.join(path))?;
            state
                .trees
                .get_mut(&current)
                .unwrap()
                .insert(path.clone(), content);
        }
        state.commits.push((current, message.to_string()));
        Ok(format!("{:040x}", state.commits.len()))
    }

    async fn commit_all(&self, message: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let current = state.current.clone();
        state.trees.insert(current.clone(), snapshot(&self.root));
        state.commits.push((current, message.to_string()));
        Ok(format!("{:040x}", state.commits.len()))
    }

    async fn push(&self, branch: &str, force: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_push {
            bail!("push rejected");
        }
        state.pushes.push((branch.to_string(), force));
        Ok(())
    }

    async fn rebase_onto_upstream(&self, _branch: &str) -> Result<()> {
        Ok(())
    }

    async fn discard_changes(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        materialize(&self.root, &state.trees[&state.current]);
        Ok(())
    }
}

struct FakeCheckouts(Arc<FakeVcs>);

impl CheckoutProvider for FakeCheckouts {
    fn checkout_for(&self, _project: &ProjectConfig) -> Arc<dyn BranchManager> {
        self.0.clone()
    }
}

// =============================================================================
// Harness
// =============================================================================

const SESSION_PHP: &str = "<?php\nfunction getUser($s) {\n    return $s->user->getId();\n}\n";
const OLD_LINE: &str = "return $s->user->getId();";
const NEW_LINE: &str = "return $s->user ? $s->user->getId() : null;";

struct Harness {
    _dir: TempDir,
    repo: PathBuf,
    project: ProjectConfig,
    tracker: Arc<FakeTracker>,
    hosting: Arc<FakeHosting>,
    agent: Arc<FakeAgent>,
    vcs: Arc<FakeVcs>,
    ctx: WorkerContext,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(adjust: impl FnOnce(&mut AutofixConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("iznik-server");
        fs::create_dir_all(repo.join("include")).unwrap();
        fs::write(repo.join("include/Session.php"), SESSION_PHP).unwrap();
        fs::write(repo.join("include/User.php"), "<?php\nclass User {}\n").unwrap();

        let project = ProjectConfig {
            module: "php".into(),
            project_id: "4504083802226688".into(),
            project_slug: "php".into(),
            repo_path: repo.clone(),
        };
        let mut config = AutofixConfig::default();
        config.projects = vec![project.clone()];
        config.poll.issue_delay_secs = 0;
        config.poll.project_delay_secs = 0;
        config.agent.retry_backoff_secs = 0;
        adjust(&mut config);

        let tracker = Arc::new(FakeTracker::default());
        let hosting = Arc::new(FakeHosting::default());
        let agent = Arc::new(FakeAgent::default());
        let vcs = Arc::new(FakeVcs::new(&repo));
        let services = Services {
            tracker: tracker.clone(),
            hosting: hosting.clone(),
            agent: agent.clone(),
            checkouts: Arc::new(FakeCheckouts(vcs.clone())),
        };
        let ledger = LedgerHandle::new(LedgerDb::new_in_memory().unwrap());
        let ctx = WorkerContext::new(services, ledger, config);

        Self {
            _dir: dir,
            repo,
            project,
            tracker,
            hosting,
            agent,
            vcs,
            ctx,
        }
    }

    async fn process(&self, issue: &Issue) -> IssueDisposition {
        process_issue(&self.ctx, &self.project, issue).await.unwrap()
    }

    async fn row(&self, issue_id: &str) -> Option<ProcessedIssue> {
        let id = issue_id.to_string();
        self.ctx.ledger.call(move |db| db.get(&id)).await.unwrap()
    }

    fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.repo.join(rel)).unwrap()
    }
}

fn issue(id: &str, count: u64, level: &str) -> Issue {
    Issue {
        id: id.into(),
        title: "TypeError: Cannot read property getId of null".into(),
        count,
        level: Some(level.into()),
        culprit: Some("include/Session.php in getUser".into()),
        metadata: IssueMetadata {
            error_type: Some("TypeError".into()),
            value: Some("Cannot read property getId of null".into()),
        },
        permalink: Some(format!("https://freegle.sentry.io/issues/{}/", id)),
        ..Default::default()
    }
}

fn analysis(confidence: &str, fix_type: &str, files: serde_json::Value) -> String {
    let body = json!({
        "rootCause": "Session user is null after logout and getId is called on it",
        "canFix": true,
        "confidence": confidence,
        "fixType": fix_type,
        "fix": "Guard the user lookup",
        "fixFiles": files,
        "reason": if confidence == "high" { "" } else { "Not sure the session is the only caller" }
    });
    format!("Here is my analysis.\n\n```json\n{}\n```\n", body)
}

fn session_fix() -> serde_json::Value {
    json!([{
        "path": "include/Session.php",
        "changes": [{"type": "replace", "lines": "3-3", "old": OLD_LINE, "new": NEW_LINE}]
    }])
}

fn open_cr(number: u64, title: &str, branch: &str) -> ChangeRequest {
    ChangeRequest {
        number,
        title: title.into(),
        url: format!("https://github.com/freegle/iznik-server/pull/{}", number),
        body: "Automated fix".into(),
        branch: branch.into(),
        state: ChangeRequestState::Open,
        closed_at: None,
    }
}

// =============================================================================
// Per-issue pipeline
// =============================================================================

mod pipeline {
    use super::*;

    #[tokio::test]
    async fn test_simple_fix_opens_change_request() {
        let h = Harness::new();
        let x1 = issue("X1", 25, "error");
        h.tracker.add_issue("php", x1.clone());
        h.agent.answer(analysis("high", "simple", session_fix()));

        let disposition = h.process(&x1).await;
        assert_eq!(disposition, IssueDisposition::Recorded(IssueStatus::Success));

        let row = h.row("X1").await.unwrap();
        assert_eq!(row.status, IssueStatus::Success);
        assert_eq!(row.attempts, 1);
        assert_eq!(
            row.change_request_url.as_deref(),
            Some("https://github.com/freegle/iznik-server/pull/101")
        );

        let created = h.hosting.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].base, "master");
        assert!(created[0].head.starts_with("sentry-auto-fix-"));
        assert!(created[0].title.starts_with("Fix: Session user is null"));
        assert!(created[0].body.contains("include/Session.php"));

        // The fix lives on the work branch; the checkout is back on trunk.
        assert_eq!(h.vcs.current(), "master");
        assert_eq!(h.read("include/Session.php"), SESSION_PHP);
        let branch_tree = h.vcs.tree(&created[0].head).unwrap();
        assert!(branch_tree[Path::new("include/Session.php")].contains(NEW_LINE));
        assert_eq!(h.vcs.pushes(), vec![(created[0].head.clone(), false)]);

        let notes = h.tracker.notes_for("X1");
        assert!(notes[0].contains(IN_PROGRESS_MARKER));
        assert!(notes.last().unwrap().contains("pull/101"));
    }

    #[tokio::test]
    async fn test_reprocessing_completed_issue_is_noop() {
        let h = Harness::new();
        let x1 = issue("X1", 25, "error");
        h.tracker.add_issue("php", x1.clone());
        h.agent.answer(analysis("high", "simple", session_fix()));
        h.process(&x1).await;
        let asks = h.agent.asks();
        let notes = h.tracker.notes_for("X1").len();

        let disposition = h.process(&x1).await;
        assert!(matches!(
            disposition,
            IssueDisposition::AlreadyHandled(LookupOutcome::Terminal {
                status: IssueStatus::Success,
                attempts: 1
            })
        ));
        assert_eq!(h.agent.asks(), asks);
        assert_eq!(h.hosting.created_count(), 1);
        assert_eq!(h.tracker.notes_for("X1").len(), notes);
        assert_eq!(h.row("X1").await.unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_missing_old_text_modifies_nothing() {
        let h = Harness::new();
        let x1 = issue("X1", 25, "error");
        h.tracker.add_issue("php", x1.clone());
        let files = json!([
            {"path": "include/Session.php", "changes": [{"type": "replace", "old": OLD_LINE, "new": NEW_LINE}]},
            {"path": "include/User.php", "changes": [{"type": "replace", "old": "class Member {}", "new": "class Member { }"}]}
        ]);
        h.agent.answer(analysis("high", "simple", files));

        let disposition = h.process(&x1).await;
        assert_eq!(disposition, IssueDisposition::Recorded(IssueStatus::Error));

        let row = h.row("X1").await.unwrap();
        let message = row.error_message.unwrap();
        assert!(message.contains("Failed to apply fix"), "{}", message);
        assert!(message.contains("include/User.php"), "{}", message);

        assert_eq!(h.read("include/Session.php"), SESSION_PHP);
        assert_eq!(h.read("include/User.php"), "<?php\nclass User {}\n");
        assert!(h.vcs.commits().is_empty());
        assert!(h.vcs.pushes().is_empty());
        assert_eq!(h.hosting.created_count(), 0);
        assert_eq!(h.vcs.current(), "master");
    }

    #[tokio::test]
    async fn test_gate_rejection_is_terminal_skip() {
        let h = Harness::new();
        let x1 = issue("X1", 25, "error");
        h.tracker.add_issue("php", x1.clone());
        h.agent.answer(analysis("low", "simple", session_fix()));

        assert_eq!(
            h.process(&x1).await,
            IssueDisposition::Recorded(IssueStatus::Skipped)
        );
        let row = h.row("X1").await.unwrap();
        assert!(row.error_message.unwrap().starts_with("Low confidence"));
        assert!(h.vcs.commits().is_empty());
        assert_eq!(h.vcs.current(), "master");

        assert!(matches!(
            h.process(&x1).await,
            IssueDisposition::AlreadyHandled(LookupOutcome::Terminal { .. })
        ));
        assert_eq!(h.agent.asks(), 1);
    }

    #[tokio::test]
    async fn test_stray_analysis_edits_are_discarded() {
        let h = Harness::new();
        let x1 = issue("X1", 25, "error");
        h.tracker.add_issue("php", x1.clone());
        h.agent.answer(analysis("low", "simple", session_fix()));
        *h.agent.ask_write.lock().unwrap() =
            Some(("include/Session.php".into(), "<?php // rewritten\n".into()));

        assert_eq!(
            h.process(&x1).await,
            IssueDisposition::Recorded(IssueStatus::Skipped)
        );
        assert_eq!(h.vcs.current(), "master");
        assert_eq!(h.read("include/Session.php"), SESSION_PHP);
        assert!(!h.vcs.has_changes().await.unwrap());
    }

    #[tokio::test]
    async fn test_existing_local_edits_are_left_alone() {
        let h = Harness::new();
        let x1 = issue("X1", 25, "error");
        h.tracker.add_issue("php", x1.clone());
        h.agent.answer(analysis("low", "simple", session_fix()));
        fs::write(h.repo.join("operator-notes.txt"), "wip").unwrap();

        h.process(&x1).await;
        assert_eq!(h.read("operator-notes.txt"), "wip");
    }

    #[tokio::test]
    async fn test_complex_fix_is_skipped() {
        let h = Harness::new();
        let x1 = issue("X1", 25, "error");
        h.tracker.add_issue("php", x1.clone());
        h.agent.answer(analysis("high", "complex", session_fix()));

        assert_eq!(
            h.process(&x1).await,
            IssueDisposition::Recorded(IssueStatus::Skipped)
        );
        assert!(h.row("X1").await.unwrap().error_message.unwrap().starts_with("Complex fix"));
    }

    #[tokio::test]
    async fn test_errors_retry_until_attempt_ceiling() {
        let h = Harness::new();
        let x1 = issue("X1", 25, "error");
        h.tracker.add_issue("php", x1.clone());

        for attempt in 1..=3u32 {
            h.agent.answer("I could not work this one out.".to_string());
            assert_eq!(
                h.process(&x1).await,
                IssueDisposition::Recorded(IssueStatus::Error)
            );
            let row = h.row("X1").await.unwrap();
            assert_eq!(row.attempts, attempt);
            assert!(row.error_message.unwrap().contains("Analysis failed"));
        }

        assert_eq!(
            h.process(&x1).await,
            IssueDisposition::AlreadyHandled(LookupOutcome::Terminal {
                status: IssueStatus::Error,
                attempts: 3
            })
        );
        assert_eq!(h.agent.asks(), 3);
    }

    #[tokio::test]
    async fn test_push_failure_is_error_and_branch_restored() {
        let h = Harness::new();
        let x1 = issue("X1", 25, "error");
        h.tracker.add_issue("php", x1.clone());
        h.agent.answer(analysis("high", "simple", session_fix()));
        h.vcs.set_fail_push(true);

        assert_eq!(
            h.process(&x1).await,
            IssueDisposition::Recorded(IssueStatus::Error)
        );
        assert!(h.row("X1").await.unwrap().error_message.unwrap().contains("push rejected"));
        assert_eq!(h.vcs.current(), "master");
        assert_eq!(h.read("include/Session.php"), SESSION_PHP);
        assert_eq!(h.hosting.created_count(), 0);
    }

    #[tokio::test]
    async fn test_open_duplicate_is_revised_in_place() {
        let h = Harness::new();
        let x1 = issue("X1", 25, "error");
        h.tracker.add_issue("php", x1.clone());
        h.agent.answer(analysis("high", "simple", session_fix()));

        let existing = open_cr(7, "Fix: getId called on a logged-out session", "sentry-auto-fix-7");
        h.hosting.open.lock().unwrap().push(existing.clone());
        h.vcs.add_branch("sentry-auto-fix-7", h.vcs.tree("master").unwrap());

        assert_eq!(
            h.process(&x1).await,
            IssueDisposition::Recorded(IssueStatus::Updated)
        );
        let row = h.row("X1").await.unwrap();
        assert_eq!(row.change_request_url.as_deref(), Some(existing.url.as_str()));

        assert_eq!(h.hosting.created_count(), 0);
        assert_eq!(h.vcs.pushes(), vec![("sentry-auto-fix-7".to_string(), true)]);
        let posted = h.hosting.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].0, 7);
        assert!(posted[0].1.starts_with(BOT_COMMENT_PREFIX));
        assert_eq!(h.vcs.current(), "master");
    }

    #[tokio::test]
    async fn test_closed_duplicate_still_opens_new_request() {
        let h = Harness::new();
        let x1 = issue("X1", 25, "error");
        h.tracker.add_issue("php", x1.clone());
        h.agent.answer(analysis("high", "simple", session_fix()));

        let mut closed = open_cr(5, "Fix: TypeError in getUser", "sentry-auto-fix-5");
        closed.state = ChangeRequestState::Closed;
        closed.closed_at = Some(Utc::now() - Duration::days(3));
        h.hosting.closed.lock().unwrap().push(closed);

        assert_eq!(
            h.process(&x1).await,
            IssueDisposition::Recorded(IssueStatus::Success)
        );
        assert_eq!(h.hosting.created_count(), 1);
    }

    #[tokio::test]
    async fn test_fresh_marker_from_other_instance_skips_without_recording() {
        let h = Harness::new();
        let x1 = issue("X1", 25, "error");
        h.tracker.add_issue("php", x1.clone());
        h.tracker.push_note(
            "X1",
            marker_text("php", "autofix-other-host", Utc::now()),
            Duration::minutes(5),
        );

        assert_eq!(h.process(&x1).await, IssueDisposition::LockedElsewhere);
        assert!(h.row("X1").await.is_none());
        assert_eq!(h.agent.asks(), 0);
        assert_eq!(h.tracker.detail_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_marker_is_taken_over() {
        let h = Harness::new();
        let x1 = issue("X1", 25, "error");
        h.tracker.add_issue("php", x1.clone());
        h.tracker.push_note(
            "X1",
            marker_text("php", "autofix-other-host", Utc::now()),
            Duration::minutes(45),
        );
        h.agent.answer(analysis("high", "simple", session_fix()));

        assert_eq!(
            h.process(&x1).await,
            IssueDisposition::Recorded(IssueStatus::Success)
        );
    }

    #[tokio::test]
    async fn test_bypass_reprocesses_completed_issue() {
        let h = Harness::with_config(|c| c.poll.bypass_checks = true);
        let x1 = issue("X1", 25, "error");
        h.tracker.add_issue("php", x1.clone());
        h.agent.answer(analysis("low", "simple", session_fix()));
        h.agent.answer(analysis("low", "simple", session_fix()));

        h.process(&x1).await;
        assert_eq!(
            h.process(&x1).await,
            IssueDisposition::Recorded(IssueStatus::Skipped)
        );
        assert_eq!(h.row("X1").await.unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_in_flight_issue_is_not_dispatched_twice() {
        let h = Harness::new();
        let x1 = issue("X1", 25, "error");
        let _claim = h.ctx.active.claim("X1").unwrap();
        assert_eq!(h.process(&x1).await, IssueDisposition::InFlight);
        assert_eq!(h.agent.asks(), 0);
    }
}

// =============================================================================
// Poll cycle
// =============================================================================

mod scheduler {
    use super::*;

    fn rejection() -> String {
        json!({"rootCause": "Unknown", "canFix": false, "reason": "Needs a human"}).to_string()
    }

    #[tokio::test]
    async fn test_cycle_ignores_non_qualifying_issues() {
        let h = Harness::new();
        h.tracker.add_issue("php", issue("X1", 25, "error"));
        h.tracker.add_issue("php", issue("X2", 2, "warning"));
        h.agent.answer(rejection());

        let (_tx, mut rx) = watch::channel(false);
        let report = run_cycle(&h.ctx, &mut rx).await;
        assert_eq!(report.issues_seen, 2);
        assert_eq!(report.qualifying, 1);
        assert_eq!(report.recorded.get("skipped"), Some(&1));
        assert!(h.row("X2").await.is_none());
    }

    #[tokio::test]
    async fn test_cycle_cap_defers_remaining_issues() {
        let h = Harness::with_config(|c| c.poll.max_issues_per_cycle = Some(1));
        for id in ["X1", "X2", "X3"] {
            h.tracker.add_issue("php", issue(id, 30, "error"));
        }
        h.agent.answer(rejection());

        let (_tx, mut rx) = watch::channel(false);
        let report = run_cycle(&h.ctx, &mut rx).await;
        assert!(report.capped);
        assert_eq!(report.attempted(), 1);
        assert!(h.row("X1").await.is_some());
        assert!(h.row("X2").await.is_none());

        // Handled issues do not count against the next cycle's cap.
        h.agent.answer(rejection());
        let report = run_cycle(&h.ctx, &mut rx).await;
        assert_eq!(report.already_handled, 1);
        assert!(h.row("X2").await.is_some());
        assert!(h.row("X3").await.is_none());
    }

    #[tokio::test]
    async fn test_issue_locked_elsewhere_does_not_use_up_cap() {
        let h = Harness::with_config(|c| c.poll.max_issues_per_cycle = Some(1));
        h.tracker.add_issue("php", issue("X1", 30, "error"));
        h.tracker.add_issue("php", issue("X2", 30, "error"));
        h.tracker.push_note(
            "X1",
            marker_text("php", "autofix-other-host", Utc::now()),
            Duration::minutes(5),
        );
        h.agent.answer(rejection());

        let (_tx, mut rx) = watch::channel(false);
        let report = run_cycle(&h.ctx, &mut rx).await;
        assert_eq!(report.locked_elsewhere, 1);
        assert_eq!(report.attempted(), 1);
        assert!(!report.capped);
        assert!(h.row("X1").await.is_none());
        assert!(h.row("X2").await.is_some());
    }

    #[tokio::test]
    async fn test_in_flight_issue_does_not_use_up_cap() {
        let h = Harness::with_config(|c| c.poll.max_issues_per_cycle = Some(1));
        h.tracker.add_issue("php", issue("X1", 30, "error"));
        h.tracker.add_issue("php", issue("X2", 30, "error"));
        let _claim = h.ctx.active.claim("X1").unwrap();
        h.agent.answer(rejection());

        let (_tx, mut rx) = watch::channel(false);
        let report = run_cycle(&h.ctx, &mut rx).await;
        assert_eq!(report.in_flight, 1);
        assert_eq!(report.attempted(), 1);
        assert!(h.row("X2").await.is_some());
    }

    #[tokio::test]
    async fn test_dirty_checkout_skips_project() {
        let h = Harness::new();
        h.tracker.add_issue("php", issue("X1", 25, "error"));
        fs::write(h.repo.join("operator-notes.txt"), "wip").unwrap();

        let (_tx, mut rx) = watch::channel(false);
        let report = run_cycle(&h.ctx, &mut rx).await;
        assert_eq!(report.skipped_projects, vec!["php"]);
        assert_eq!(h.agent.asks(), 0);
        assert!(h.repo.join("operator-notes.txt").exists());
    }

    #[tokio::test]
    async fn test_cycle_reconciles_abandoned_work_branch() {
        let h = Harness::new();
        h.vcs.add_branch("sentry-auto-fix-9", h.vcs.tree("master").unwrap());
        h.vcs.switch_to("sentry-auto-fix-9");
        fs::write(h.repo.join("include/Session.php"), "half-written").unwrap();
        h.tracker.add_issue("php", issue("X1", 25, "error"));
        h.agent.answer(rejection());

        let (_tx, mut rx) = watch::channel(false);
        let report = run_cycle(&h.ctx, &mut rx).await;
        assert!(report.skipped_projects.is_empty());
        assert_eq!(h.vcs.current(), "master");
        assert_eq!(h.read("include/Session.php"), SESSION_PHP);
        assert_eq!(report.attempted(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_before_next_issue() {
        let h = Harness::new();
        h.tracker.add_issue("php", issue("X1", 25, "error"));
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();

        let report = run_cycle(&h.ctx, &mut rx).await;
        assert!(report.interrupted);
        assert_eq!(h.agent.asks(), 0);
    }
}

// =============================================================================
// PR monitor
// =============================================================================

mod monitor {
    use super::*;

    const CR_URL: &str = "https://github.com/freegle/iznik-server/pull/7";

    fn comment(id: &str, author: &str, body: &str) -> ReviewComment {
        ReviewComment {
            id: id.into(),
            author: author.into(),
            body: body.into(),
            created_at: None,
            kind: CommentKind::Comment,
        }
    }

    async fn tracked(h: &Harness) {
        h.ctx
            .ledger
            .record(
                IssueOutcome::new("X1", "php", "TypeError", IssueStatus::Success)
                    .with_change_request(CR_URL),
            )
            .await
            .unwrap();
        h.hosting
            .open
            .lock()
            .unwrap()
            .push(open_cr(7, "Fix: null session user", "sentry-auto-fix-7"));
        h.vcs.add_branch("sentry-auto-fix-7", h.vcs.tree("master").unwrap());
        h.hosting.comments.lock().unwrap().insert(
            7,
            vec![
                comment("c1", "autofix-bot", &format!("{} opened this", BOT_COMMENT_PREFIX)),
                comment("c2", "alice", "Please also log when the user is missing"),
            ],
        );
    }

    fn needs_revision(needed: bool) -> String {
        json!({
            "needsRevision": needed,
            "summary": "Log when the session user is missing",
            "requestedChanges": ["add a log line"]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_revision_is_committed_pushed_and_answered() {
        let h = Harness::new();
        tracked(&h).await;
        h.agent.answer(needs_revision(true));
        *h.agent.edit_write.lock().unwrap() =
            Some(("include/Log.php".into(), "<?php // log\n".into()));

        let report = run_sweep(&h.ctx).await.unwrap();
        assert_eq!(report.change_requests, 1);
        assert_eq!(report.own_comments, 1);
        assert_eq!(report.actions.get("revised"), Some(&1));

        let commits = h.vcs.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].0, "sentry-auto-fix-7");
        assert_eq!(h.vcs.pushes(), vec![("sentry-auto-fix-7".to_string(), false)]);
        let tree = h.vcs.tree("sentry-auto-fix-7").unwrap();
        assert!(tree.contains_key(Path::new("include/Log.php")));

        let posted = h.hosting.posted();
        assert_eq!(posted.len(), 1);
        assert!(posted[0].1.starts_with(BOT_COMMENT_PREFIX));
        assert!(posted[0].1.contains("@alice"));

        assert_eq!(h.vcs.current(), "master");
        assert!(!h.repo.join("include/Log.php").exists());
        assert!(h.ctx.ledger.is_comment_processed(CR_URL, "c2").await.unwrap());
    }

    #[tokio::test]
    async fn test_comment_is_actioned_once() {
        let h = Harness::new();
        tracked(&h).await;
        h.agent.answer(needs_revision(false));

        run_sweep(&h.ctx).await.unwrap();
        let report = run_sweep(&h.ctx).await.unwrap();
        assert_eq!(report.already_processed, 1);
        assert!(report.actions.is_empty());
        assert_eq!(h.agent.asks(), 1);
    }

    #[tokio::test]
    async fn test_no_revision_needed_posts_nothing() {
        let h = Harness::new();
        tracked(&h).await;
        h.agent.answer(needs_revision(false));

        let report = run_sweep(&h.ctx).await.unwrap();
        assert_eq!(report.actions.get("no_revision_needed"), Some(&1));
        assert!(h.hosting.posted().is_empty());
        assert_eq!(h.agent.edits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_revision_without_diff_still_replies() {
        let h = Harness::new();
        tracked(&h).await;
        h.agent.answer(needs_revision(true));

        let report = run_sweep(&h.ctx).await.unwrap();
        assert_eq!(report.actions.get("no_changes"), Some(&1));
        assert!(h.vcs.commits().is_empty());
        let posted = h.hosting.posted();
        assert_eq!(posted.len(), 1);
        assert!(posted[0].1.contains("No code changes"));
    }

    #[tokio::test]
    async fn test_failed_revision_resets_and_explains() {
        let h = Harness::new();
        tracked(&h).await;
        h.agent.answer(needs_revision(true));
        *h.agent.edit_write.lock().unwrap() =
            Some(("include/Log.php".into(), "<?php // log\n".into()));
        h.vcs.set_fail_push(true);

        let report = run_sweep(&h.ctx).await.unwrap();
        assert_eq!(report.actions.get("failed"), Some(&1));
        let posted = h.hosting.posted();
        assert_eq!(posted.len(), 1);
        assert!(posted[0].1.contains("push rejected"));
        assert_eq!(h.vcs.current(), "master");
        assert!(!h.repo.join("include/Log.php").exists());
        assert!(h.ctx.ledger.is_comment_processed(CR_URL, "c2").await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_change_request_is_ignored() {
        let h = Harness::new();
        tracked(&h).await;
        h.hosting.open.lock().unwrap()[0].state = ChangeRequestState::Merged;

        let report = run_sweep(&h.ctx).await.unwrap();
        assert_eq!(report.not_open, 1);
        assert_eq!(report.comments_seen, 0);
        assert_eq!(h.agent.asks(), 0);

        // A merged request is untracked, so later sweeps do not fetch it.
        let report = run_sweep(&h.ctx).await.unwrap();
        assert_eq!(report.change_requests, 0);
        assert_eq!(report.not_open, 0);
        let rows = h.ctx.ledger.call(|db| db.tracked_change_requests()).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_unclassifiable_comment_is_answered_once() {
        let h = Harness::new();
        tracked(&h).await;

        let report = run_sweep(&h.ctx).await.unwrap();
        assert_eq!(report.actions.get("failed"), Some(&1));
        let posted = h.hosting.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].0, 7);
        assert!(posted[0].1.starts_with(BOT_COMMENT_PREFIX));
        assert!(posted[0].1.contains("@alice"));
        assert!(posted[0].1.contains("could not process"));
        assert!(h.ctx.ledger.is_comment_processed(CR_URL, "c2").await.unwrap());

        let report = run_sweep(&h.ctx).await.unwrap();
        assert_eq!(report.already_processed, 1);
        assert_eq!(h.hosting.posted().len(), 1);
        assert_eq!(h.agent.asks(), 1);
    }

    #[tokio::test]
    async fn test_comment_is_recorded_before_reply() {
        let h = Harness::new();
        tracked(&h).await;
        *h.hosting.reply_check.lock().unwrap() =
            Some((h.ctx.ledger.clone(), CR_URL.to_string(), "c2".to_string()));
        h.agent.answer(needs_revision(true));

        run_sweep(&h.ctx).await.unwrap();
        assert_eq!(*h.hosting.recorded_at_reply.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_failed_reply_does_not_repeat_revision() {
        let h = Harness::new();
        tracked(&h).await;
        h.hosting.fail_post.store(true, Ordering::SeqCst);
        h.agent.answer(needs_revision(true));
        *h.agent.edit_write.lock().unwrap() =
            Some(("include/Log.php".into(), "<?php // log\n".into()));

        let report = run_sweep(&h.ctx).await.unwrap();
        assert_eq!(report.actions.get("revised"), Some(&1));
        assert!(h.hosting.posted().is_empty());

        h.hosting.fail_post.store(false, Ordering::SeqCst);
        let report = run_sweep(&h.ctx).await.unwrap();
        assert_eq!(report.already_processed, 1);
        assert_eq!(h.vcs.commits().len(), 1);
        assert_eq!(h.agent.edits.load(Ordering::SeqCst), 1);
        assert!(h.hosting.posted().is_empty());
    }
}
