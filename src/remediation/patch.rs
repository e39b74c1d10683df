//! Patch Applier: branch, exact-substring patch, commit, push.
//!
//! Patches are computed entirely in memory before any file is written, so a
//! missing `old` text in any change leaves every file untouched.

use std::future::Future;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

use crate::agent::IssueAnalysis;
use crate::agent::contract::FileFix;
use crate::errors::PatchError;
use crate::tracker::Issue;
use crate::vcs::BranchManager;

/// Turn a path as written by the agent into a repository-relative path.
///
/// Accepts `./x`, `<repo-dir-name>/x` and absolute paths inside the
/// repository. Anything that leaves the repository is rejected.
pub fn normalize_path(repo: &Path, raw: &str) -> Result<PathBuf, PatchError> {
    let escapes = || PatchError::PathEscapesRepository {
        path: raw.to_string(),
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(escapes());
    }

    let mut path = PathBuf::from(trimmed);
    if path.is_absolute() {
        path = path.strip_prefix(repo).map_err(|_| escapes())?.to_path_buf();
    }

    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(escapes());
            }
        }
    }
    if parts.is_empty() {
        return Err(escapes());
    }

    // Agents often prefix the repository's own directory name.
    if parts.len() > 1
        && repo.file_name() == Some(parts[0])
        && !repo.join(parts[0]).exists()
    {
        parts.remove(0);
    }

    Ok(parts.iter().collect())
}

/// New contents of one file, ready to be written.
#[derive(Debug, Clone)]
pub struct PreparedFile {
    pub relative: PathBuf,
    pub full: PathBuf,
    pub original: String,
    pub patched: String,
}

/// Compute every file's new contents. Changes are applied in order; several
/// entries for one path compose. The first occurrence of `old` is replaced.
pub fn prepare(repo: &Path, fix_files: &[FileFix]) -> Result<Vec<PreparedFile>, PatchError> {
    if fix_files.iter().all(|f| f.changes.is_empty()) {
        return Err(PatchError::EmptyFix);
    }

    let mut prepared: Vec<PreparedFile> = Vec::new();
    for file in fix_files {
        let relative = normalize_path(repo, &file.path)?;
        let index = match prepared.iter().position(|p| p.relative == relative) {
            Some(index) => index,
            None => {
                let full = repo.join(&relative);
                if !full.is_file() {
                    return Err(PatchError::FileNotFound { path: full });
                }
                let original = std::fs::read_to_string(&full).map_err(|source| PatchError::Read {
                    path: full.clone(),
                    source,
                })?;
                prepared.push(PreparedFile {
                    relative: relative.clone(),
                    full,
                    patched: original.clone(),
                    original,
                });
                prepared.len() - 1
            }
        };

        let entry = &mut prepared[index];
        for change in &file.changes {
            if change.kind != "replace" {
                return Err(PatchError::UnsupportedChange {
                    path: file.path.clone(),
                    kind: change.kind.clone(),
                });
            }
            if change.old.is_empty() || !entry.patched.contains(&change.old) {
                return Err(PatchError::OldTextNotFound {
                    path: file.path.clone(),
                });
            }
            entry.patched = entry.patched.replacen(&change.old, &change.new, 1);
        }
    }

    prepared.retain(|p| p.patched != p.original);
    if prepared.is_empty() {
        return Err(PatchError::EmptyFix);
    }
    Ok(prepared)
}

/// Write prepared files. If any write fails, files already written are put
/// back to their original contents.
pub fn write(prepared: &[PreparedFile]) -> Result<(), PatchError> {
    for (i, file) in prepared.iter().enumerate() {
        if let Err(source) = std::fs::write(&file.full, &file.patched) {
            for done in &prepared[..i] {
                if let Err(e) = std::fs::write(&done.full, &done.original) {
                    tracing::error!(path = %done.full.display(), error = %e, "Could not roll back file");
                }
            }
            return Err(PatchError::Write {
                path: file.full.clone(),
                source,
            });
        }
    }
    Ok(())
}

/// Run `work`, then put the checkout back on the branch it started on,
/// whatever the outcome. Uncommitted leftovers on the work branch are
/// discarded before switching back. If `work` ends on the starting branch
/// and that branch was clean beforehand, its new edits are discarded too.
pub async fn with_branch_restored<T, F>(vcs: &dyn BranchManager, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let original = vcs
        .current_branch()
        .await
        .context("Failed to read the current branch")?;
    let was_clean = matches!(vcs.has_changes().await, Ok(false));
    let result = work.await;
    restore_branch(vcs, &original, was_clean).await;
    result
}

async fn restore_branch(vcs: &dyn BranchManager, original: &str, was_clean: bool) {
    let current = match vcs.current_branch().await {
        Ok(current) => current,
        Err(e) => {
            tracing::error!(branch = original, error = %format!("{:#}", e), "Could not read branch before restoring");
            String::new()
        }
    };
    if current == original {
        if was_clean && matches!(vcs.has_changes().await, Ok(true)) {
            tracing::warn!(branch = original, "Discarding edits left on the starting branch");
            if let Err(e) = vcs.discard_changes().await {
                tracing::error!(error = %format!("{:#}", e), "Could not discard leftover changes");
            }
        }
        return;
    }
    match vcs.has_changes().await {
        Ok(false) => {}
        Ok(true) | Err(_) => {
            if let Err(e) = vcs.discard_changes().await {
                tracing::error!(error = %format!("{:#}", e), "Could not discard leftover changes");
            }
        }
    }
    if let Err(e) = vcs.checkout(original).await {
        tracing::error!(branch = original, error = %format!("{:#}", e), "Could not restore original branch");
    } else {
        tracing::debug!(branch = original, "Restored original branch");
    }
}

/// Where the fix lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchPlan {
    /// Fresh branch from the trunk tip.
    New { branch: String },
    /// Existing change-request branch, reset to the trunk tip first.
    Revise { branch: String },
}

impl BranchPlan {
    pub fn branch(&self) -> &str {
        match self {
            BranchPlan::New { branch } | BranchPlan::Revise { branch } => branch,
        }
    }

    pub fn is_revision(&self) -> bool {
        matches!(self, BranchPlan::Revise { .. })
    }
}

#[derive(Debug, Clone)]
pub struct AppliedFix {
    pub branch: String,
    pub files: Vec<PathBuf>,
    pub commit: String,
    pub revision: bool,
}

pub fn branch_name(prefix: &str, now: chrono::DateTime<chrono::Utc>) -> String {
    format!("{}{}", prefix, now.timestamp_millis())
}

pub fn commit_message(issue: &Issue, analysis: &IssueAnalysis) -> String {
    let summary: String = analysis
        .root_cause
        .lines()
        .next()
        .unwrap_or("")
        .chars()
        .take(60)
        .collect();
    format!(
        "Fix: {}\n\nRoot cause: {}\n\nFix: {}\n\nConfidence: {}\nFix type: {}\nIssue: {}\n",
        summary,
        analysis.root_cause,
        analysis.fix,
        analysis.confidence.as_str(),
        analysis.fix_type.as_str(),
        issue.reference()
    )
}

/// Branch, patch, commit and push. Revisions are force-pushed since their
/// branch was rewound to trunk.
pub async fn apply_fix(
    vcs: &dyn BranchManager,
    plan: &BranchPlan,
    issue: &Issue,
    analysis: &IssueAnalysis,
) -> Result<AppliedFix> {
    let branch = plan.branch();
    match plan {
        BranchPlan::New { .. } => vcs.create_branch_from_trunk(branch).await?,
        BranchPlan::Revise { .. } => vcs.reset_branch_to_trunk(branch).await?,
    }

    let prepared = prepare(vcs.repo_path(), &analysis.fix_files)?;
    write(&prepared)?;
    let files: Vec<PathBuf> = prepared.iter().map(|p| p.relative.clone()).collect();
    tracing::info!(branch, files = files.len(), "Patch applied");

    let commit = vcs
        .commit_paths(&files, &commit_message(issue, analysis))
        .await?;
    vcs.push(branch, plan.is_revision()).await?;
    tracing::info!(branch, commit = %commit, "Fix pushed");

    Ok(AppliedFix {
        branch: branch.to_string(),
        files,
        commit,
        revision: plan.is_revision(),
    })
}
