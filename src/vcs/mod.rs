//! Version-control seam over one project checkout.

pub mod git;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{GitConfig, ProjectConfig};

pub use git::GitRepo;

/// Branch and commit primitives against one local checkout and its remote.
#[async_trait]
pub trait BranchManager: Send + Sync {
    fn repo_path(&self) -> &Path;

    fn trunk(&self) -> &str;

    /// Name of the checked-out branch, or the commit id when HEAD is detached.
    async fn current_branch(&self) -> Result<String>;

    async fn checkout(&self, branch: &str) -> Result<()>;

    /// Create `branch` from the freshly fetched trunk tip and check it out.
    async fn create_branch_from_trunk(&self, branch: &str) -> Result<()>;

    /// Check out an existing remote branch and hard-reset it to the trunk tip,
    /// discarding whatever a previous attempt left on it.
    async fn reset_branch_to_trunk(&self, branch: &str) -> Result<()>;

    /// Check out an existing remote branch at its remote tip.
    async fn checkout_remote_branch(&self, branch: &str) -> Result<()>;

    /// Uncommitted changes, including untracked files.
    async fn has_changes(&self) -> Result<bool>;

    /// Stage exactly `paths` (repository-relative) and commit them.
    async fn commit_paths(&self, paths: &[PathBuf], message: &str) -> Result<String>;

    /// Stage every change in the working copy and commit it.
    async fn commit_all(&self, message: &str) -> Result<String>;

    async fn push(&self, branch: &str, force: bool) -> Result<()>;

    /// Rebase the checked-out branch onto its upstream counterpart.
    async fn rebase_onto_upstream(&self, branch: &str) -> Result<()>;

    /// Drop all uncommitted changes, tracked and untracked.
    async fn discard_changes(&self) -> Result<()>;
}

/// Resolves the checkout of a configured project.
pub trait CheckoutProvider: Send + Sync {
    fn checkout_for(&self, project: &ProjectConfig) -> Arc<dyn BranchManager>;
}

/// Provider that opens each project's repository with the git backend.
pub struct GitCheckouts {
    git: GitConfig,
}

impl GitCheckouts {
    pub fn new(git: GitConfig) -> Self {
        Self { git }
    }
}

impl CheckoutProvider for GitCheckouts {
    fn checkout_for(&self, project: &ProjectConfig) -> Arc<dyn BranchManager> {
        Arc::new(GitRepo::new(&project.repo_path, &self.git))
    }
}
