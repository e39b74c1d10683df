use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::{IndexAddOption, Repository, Signature, StatusOptions};

use super::BranchManager;
use crate::config::GitConfig;
use crate::process;

/// Git checkout driven by git2 for local state (status, commits) and by the
/// git CLI for anything that talks to the remote or rewrites the working tree.
pub struct GitRepo {
    path: PathBuf,
    trunk: String,
    remote: String,
    timeout: Duration,
}

impl GitRepo {
    pub fn new(path: &Path, config: &GitConfig) -> Self {
        Self {
            path: path.to_path_buf(),
            trunk: config.trunk.clone(),
            remote: config.remote.clone(),
            timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let out = process::run("git", args, &self.path, self.timeout).await?;
        Ok(out.stdout)
    }

    async fn fetch(&self, branch: &str) -> Result<()> {
        self.git(&["fetch", &self.remote, branch])
            .await
            .with_context(|| format!("Failed to fetch {}/{}", self.remote, branch))?;
        Ok(())
    }

    /// Run a git2 operation on the blocking pool. `Repository` is not `Sync`,
    /// so each call opens its own handle.
    async fn with_repo<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Repository) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&path)
                .with_context(|| format!("Failed to open git repository at {}", path.display()))?;
            f(&repo)
        })
        .await
        .context("git task panicked")?
    }
}

/// Signature from the repository's configuration, falling back to a fixed
/// identity when none is configured.
fn signature(repo: &Repository) -> Result<Signature<'static>> {
    match repo.signature() {
        Ok(sig) => Ok(sig.to_owned()),
        Err(_) => Ok(Signature::now("autofix", "autofix@localhost")?),
    }
}

fn commit_index(repo: &Repository, index: &mut git2::Index, message: &str) -> Result<String> {
    index.write()?;
    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let sig = signature(repo)?;
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    Ok(oid.to_string())
}

#[async_trait]
impl BranchManager for GitRepo {
    fn repo_path(&self) -> &Path {
        &self.path
    }

    fn trunk(&self) -> &str {
        &self.trunk
    }

    async fn current_branch(&self) -> Result<String> {
        self.with_repo(|repo| {
            let head = repo.head().context("Failed to read HEAD")?;
            if head.is_branch()
                && let Some(name) = head.shorthand()
            {
                return Ok(name.to_string());
            }
            let commit = head.peel_to_commit().context("HEAD does not point to a commit")?;
            Ok(commit.id().to_string())
        })
        .await
    }

    async fn checkout(&self, branch: &str) -> Result<()> {
        self.git(&["checkout", branch])
            .await
            .with_context(|| format!("Failed to check out {}", branch))?;
        Ok(())
    }

    async fn create_branch_from_trunk(&self, branch: &str) -> Result<()> {
        self.fetch(&self.trunk).await?;
        let start = format!("{}/{}", self.remote, self.trunk);
        self.git(&["checkout", "-b", branch, &start])
            .await
            .with_context(|| format!("Failed to create branch {} from {}", branch, start))?;
        Ok(())
    }

    async fn reset_branch_to_trunk(&self, branch: &str) -> Result<()> {
        self.checkout_remote_branch(branch).await?;
        self.fetch(&self.trunk).await?;
        let trunk_tip = format!("{}/{}", self.remote, self.trunk);
        self.git(&["reset", "--hard", &trunk_tip])
            .await
            .with_context(|| format!("Failed to reset {} to {}", branch, trunk_tip))?;
        Ok(())
    }

    async fn checkout_remote_branch(&self, branch: &str) -> Result<()> {
        self.fetch(branch).await?;
        let remote_ref = format!("{}/{}", self.remote, branch);
        self.git(&["checkout", "-B", branch, &remote_ref])
            .await
            .with_context(|| format!("Failed to check out {}", remote_ref))?;
        Ok(())
    }

    async fn has_changes(&self) -> Result<bool> {
        self.with_repo(|repo| {
            let mut opts = StatusOptions::new();
            opts.include_untracked(true)
                .recurse_untracked_dirs(true)
                .include_ignored(false);
            let statuses = repo
                .statuses(Some(&mut opts))
                .context("Failed to read working copy status")?;
            Ok(!statuses.is_empty())
        })
        .await
    }

    async fn commit_paths(&self, paths: &[PathBuf], message: &str) -> Result<String> {
        let paths = paths.to_vec();
        let message = message.to_string();
        self.with_repo(move |repo| {
            let mut index = repo.index()?;
            for path in &paths {
                index
                    .add_path(path)
                    .with_context(|| format!("Failed to stage {}", path.display()))?;
            }
            commit_index(repo, &mut index, &message)
        })
        .await
    }

    async fn commit_all(&self, message: &str) -> Result<String> {
        let message = message.to_string();
        self.with_repo(move |repo| {
            let mut index = repo.index()?;
            index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
            index.update_all(["*"].iter(), None)?;
            commit_index(repo, &mut index, &message)
        })
        .await
    }

    async fn push(&self, branch: &str, force: bool) -> Result<()> {
        let mut args = vec!["push", "-u"];
        if force {
            args.push("--force-with-lease");
        }
        args.push(&self.remote);
        args.push(branch);
        self.git(&args)
            .await
            .with_context(|| format!("Failed to push {}", branch))?;
        Ok(())
    }

    async fn rebase_onto_upstream(&self, branch: &str) -> Result<()> {
        self.fetch(branch).await?;
        let upstream = format!("{}/{}", self.remote, branch);
        if let Err(e) = self.git(&["rebase", &upstream]).await {
            // Leave the checkout usable for the next attempt.
            let _ = self.git(&["rebase", "--abort"]).await;
            return Err(e).with_context(|| format!("Failed to rebase onto {}", upstream));
        }
        Ok(())
    }

    async fn discard_changes(&self) -> Result<()> {
        self.git(&["reset", "--hard", "HEAD"])
            .await
            .context("Failed to reset working copy")?;
        self.git(&["clean", "-fd"])
            .await
            .context("Failed to remove untracked files")?;
        Ok(())
    }
}
