//! Explicit worker context passed through the pipeline: the external
//! services, the ledger, the settings, and the in-process coordination state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use crate::agent::{CodeAgent, RetryPolicy};
use crate::config::AutofixConfig;
use crate::hosting::ChangeRequestClient;
use crate::ledger::LedgerHandle;
use crate::tracker::IssueTracker;
use crate::vcs::CheckoutProvider;

/// External collaborators, each behind its trait so tests can swap in fakes.
#[derive(Clone)]
pub struct Services {
    pub tracker: Arc<dyn IssueTracker>,
    pub hosting: Arc<dyn ChangeRequestClient>,
    pub agent: Arc<dyn CodeAgent>,
    pub checkouts: Arc<dyn CheckoutProvider>,
}

#[derive(Clone)]
pub struct WorkerContext {
    pub services: Services,
    pub ledger: LedgerHandle,
    pub config: Arc<AutofixConfig>,
    pub retry: RetryPolicy,
    pub active: ActiveSet,
    pub checkout_locks: CheckoutLocks,
    /// Identifies this process in the markers it posts.
    pub instance_id: String,
}

impl WorkerContext {
    pub fn new(services: Services, ledger: LedgerHandle, config: AutofixConfig) -> Self {
        let retry = RetryPolicy {
            max_attempts: config.agent.retry_attempts.max(1),
            backoff: std::time::Duration::from_secs(config.agent.retry_backoff_secs),
        };
        Self {
            services,
            ledger,
            config: Arc::new(config),
            retry,
            active: ActiveSet::default(),
            checkout_locks: CheckoutLocks::default(),
            instance_id: format!(
                "autofix-{}-{}",
                std::process::id(),
                chrono::Utc::now().timestamp_millis()
            ),
        }
    }
}

/// Issue ids being worked by this process.
#[derive(Clone, Default)]
pub struct ActiveSet {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ActiveSet {
    /// Claim `issue_id`. Returns `None` when it is already in flight. The
    /// claim is released when the returned guard drops.
    pub fn claim(&self, issue_id: &str) -> Option<ActiveClaim> {
        let mut set = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(issue_id.to_string()) {
            return None;
        }
        Some(ActiveClaim {
            set: self.inner.clone(),
            issue_id: issue_id.to_string(),
        })
    }

    pub fn snapshot(&self) -> Vec<String> {
        let set = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = set.iter().cloned().collect();
        ids.sort();
        ids
    }
}

pub struct ActiveClaim {
    set: Arc<Mutex<HashSet<String>>>,
    issue_id: String,
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.issue_id);
    }
}

/// One async mutex per project checkout. The poll and monitor loops both
/// take it before touching the working copy.
#[derive(Clone, Default)]
pub struct CheckoutLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl CheckoutLocks {
    pub async fn lock(&self, project: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(project.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }
}
