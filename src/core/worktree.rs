#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use crate::core::git::Git;
use crate::error::PushdError;

/// Branch-per-task worktree lifecycle. The worktree directory exists only
/// while a run is active; the branch survives every run so a re-run replays
/// commits through a fresh worktree on the same branch.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    git: Git,
}

/// `push-{display_number}-{suffix}`. The machine suffix keeps branches from
/// colliding when several machines work the same repository.
#[must_use]
pub fn branch_name(display_number: u64, suffix: &str) -> String {
    format!("push-{display_number}-{suffix}")
}

/// Worktrees live next to the repository, named after their branch.
#[must_use]
pub fn worktree_path(repo_path: &Path, branch: &str) -> PathBuf {
    repo_path
        .parent()
        .unwrap_or(repo_path)
        .join(branch)
}

impl WorktreeManager {
    #[must_use]
    pub fn new(repo_path: PathBuf) -> Self {
        Self {
            git: Git::new(repo_path),
        }
    }

    #[must_use]
    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Create (or reuse) the worktree for a task branch and return its path.
    ///
    /// An existing directory is reused as-is. Otherwise the branch is created
    /// with the worktree; if the branch already exists from an earlier run,
    /// the add is retried without `-b` so branch history is kept.
    pub async fn create(&self, branch: &str) -> Result<PathBuf, PushdError> {
        let path = worktree_path(self.git.repo_root(), branch);
        if path.exists() {
            tracing::info!(worktree = %path.display(), "reusing existing worktree");
            return Ok(path);
        }

        let path_str = path.to_string_lossy().to_string();
        match self
            .git
            .run(&["worktree", "add", "-b", branch, &path_str])
            .await
        {
            Ok(_) => {
                tracing::info!(worktree = %path.display(), branch, "created worktree");
                Ok(path)
            }
            Err(first_err) => {
                match self.git.run(&["worktree", "add", &path_str, branch]).await {
                    Ok(_) => {
                        tracing::info!(
                            worktree = %path.display(),
                            branch,
                            "created worktree on existing branch"
                        );
                        Ok(path)
                    }
                    Err(_) => Err(PushdError::Worktree(format!(
                        "failed to create worktree at {}: {first_err}",
                        path.display()
                    ))),
                }
            }
        }
    }

    /// Remove the worktree directory. The branch is never deleted.
    pub async fn remove(&self, path: &Path) -> Result<(), PushdError> {
        let path_str = path.to_string_lossy().to_string();
        self.git
            .run(&["worktree", "remove", "--force", &path_str])
            .await
            .map_err(|e| PushdError::Worktree(format!("failed to remove worktree: {e}")))?;
        tracing::info!(worktree = %path.display(), "removed worktree");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_names_embed_task_and_machine() {
        assert_eq!(branch_name(427, "a1b2c3d4"), "push-427-a1b2c3d4");
    }

    #[test]
    fn worktree_is_sibling_of_repo() {
        let path = worktree_path(Path::new("/home/u/src/repo"), "push-427-a1b2c3d4");
        assert_eq!(path, PathBuf::from("/home/u/src/push-427-a1b2c3d4"));
    }
}
