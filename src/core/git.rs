#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use crate::error::PushdError;

/// Deadline for every git invocation.
const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Thin wrapper around the `git` binary rooted in a repository working copy.
#[derive(Debug, Clone)]
pub struct Git {
    repo_root: PathBuf,
}

impl Git {
    #[must_use]
    pub fn new(repo_root: PathBuf) -> Self {
        Self { repo_root }
    }

    #[must_use]
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub async fn is_repository(&self) -> bool {
        matches!(
            self.run_raw(&self.repo_root, &["rev-parse", "--git-dir"]).await,
            Ok(out) if out.status.success()
        )
    }

    pub async fn remote_url(&self) -> Result<String, PushdError> {
        let out = self.run(&["remote", "get-url", "origin"]).await?;
        Ok(out.trim().to_owned())
    }

    /// Default branch short name (`main`/`master`), from origin's HEAD when
    /// known.
    pub async fn default_branch(&self) -> String {
        if let Ok(out) = self
            .run(&["symbolic-ref", "--short", "refs/remotes/origin/HEAD"])
            .await
        {
            let name = out.trim();
            if let Some(short) = name.strip_prefix("origin/") {
                return short.to_owned();
            }
            if !name.is_empty() {
                return name.to_owned();
            }
        }
        "main".to_owned()
    }

    /// Whether `branch` carries commits that `base` does not.
    pub async fn has_commits_beyond(&self, branch: &str, base: &str) -> bool {
        match self
            .run(&["rev-list", "--count", &format!("{base}..{branch}")])
            .await
        {
            Ok(out) => out.trim().parse::<u64>().map(|n| n > 0).unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn push_branch(&self, branch: &str) -> Result<(), PushdError> {
        let _ = self.run(&["push", "-u", "origin", branch]).await?;
        Ok(())
    }

    pub async fn run(&self, args: &[&str]) -> Result<String, PushdError> {
        let out = self.run_raw(&self.repo_root, args).await?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Err(PushdError::Other(format!(
                "git {}: {}",
                args.join(" "),
                stderr.trim()
            )))
        }
    }

    pub async fn run_in_dir(&self, dir: &Path, args: &[&str]) -> Result<String, PushdError> {
        let out = self.run_raw(dir, args).await?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Err(PushdError::Other(format!(
                "git {}: {}",
                args.join(" "),
                stderr.trim()
            )))
        }
    }

    pub async fn run_raw(&self, dir: &Path, args: &[&str]) -> Result<Output, PushdError> {
        let fut = tokio::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .output();
        match tokio::time::timeout(GIT_TIMEOUT, fut).await {
            Ok(Ok(out)) => Ok(out),
            Ok(Err(e)) => match e.kind() {
                std::io::ErrorKind::NotFound => Err(PushdError::GitNotFound),
                _ => Err(PushdError::Other(format!("failed to run git: {e}"))),
            },
            Err(_) => Err(PushdError::GitTimeout {
                args: args.join(" "),
                timeout_secs: GIT_TIMEOUT.as_secs(),
            }),
        }
    }
}
