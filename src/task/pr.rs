#![forbid(unsafe_code)]

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use crate::core::git::Git;
use crate::task::model::Task;

const GH_TIMEOUT: Duration = Duration::from_secs(30);

/// After a successful run: push the task branch and open a pull request via
/// `gh`. Best-effort; every failure is logged and swallowed. With
/// `auto_merge`, the created PR is additionally flagged to merge once checks
/// pass.
///
/// Returns the PR URL (first line of `gh` stdout) when one was created.
pub async fn open_pull_request(
    repo_path: &Path,
    worktree: &Path,
    branch: &str,
    task: &Task,
    auto_merge: bool,
) -> Option<String> {
    let git = Git::new(repo_path.to_path_buf());

    let base = git.default_branch().await;
    let upstream_base = format!("origin/{base}");
    if !git.has_commits_beyond(branch, &upstream_base).await
        && !git.has_commits_beyond(branch, &base).await
    {
        tracing::info!(branch, "no commits beyond {base}, skipping pull request");
        return None;
    }

    if let Err(e) = git.push_branch(branch).await {
        tracing::warn!(branch, error = %e, "failed to push branch, skipping pull request");
        return None;
    }

    let title = pr_title(task);
    let body = pr_body(task);
    let output = tokio::time::timeout(
        GH_TIMEOUT,
        tokio::process::Command::new("gh")
            .args([
                "pr",
                "create",
                "--head",
                branch,
                "--title",
                title.as_str(),
                "--body",
                body.as_str(),
            ])
            .current_dir(worktree)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output(),
    )
    .await;

    match output {
        Ok(Ok(out)) if out.status.success() => {
            let stdout = String::from_utf8_lossy(&out.stdout);
            let url = stdout.lines().next().map(|l| l.trim().to_owned())?;
            if url.is_empty() {
                None
            } else {
                tracing::info!(branch, url = %url, "opened pull request");
                if auto_merge {
                    enable_auto_merge(worktree, &url).await;
                }
                Some(url)
            }
        }
        Ok(Ok(out)) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            tracing::warn!(branch, stderr = %stderr.trim(), "gh pr create failed");
            None
        }
        Ok(Err(e)) => {
            tracing::warn!(branch, error = %e, "could not run gh");
            None
        }
        Err(_) => {
            tracing::warn!(branch, "gh pr create timed out");
            None
        }
    }
}

async fn enable_auto_merge(worktree: &Path, url: &str) {
    let result = tokio::time::timeout(
        GH_TIMEOUT,
        tokio::process::Command::new("gh")
            .args(["pr", "merge", "--auto", "--squash", url])
            .current_dir(worktree)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output(),
    )
    .await;
    match result {
        Ok(Ok(out)) if out.status.success() => {
            tracing::info!(url, "auto-merge enabled");
        }
        Ok(Ok(out)) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            tracing::warn!(url, stderr = %stderr.trim(), "could not enable auto-merge");
        }
        _ => tracing::warn!(url, "could not enable auto-merge"),
    }
}

fn pr_title(task: &Task) -> String {
    let summary = task.summary.trim();
    let title = if summary.is_empty() {
        format!("Push task #{}", task.display_number)
    } else {
        format!("Push #{}: {summary}", task.display_number)
    };
    truncate_chars(&title, 72)
}

fn pr_body(task: &Task) -> String {
    format!(
        "{}\n\n---\nOpened automatically by the Push daemon for task #{}.",
        task.instruction().trim(),
        task.display_number
    )
}

fn truncate_chars(s: &str, n: usize) -> String {
    if s.chars().count() <= n {
        s.to_owned()
    } else {
        let mut out: String = s.chars().take(n.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        serde_json::from_value(serde_json::json!({
            "id": "t-1",
            "displayNumber": 427,
            "summary": "fix login",
            "normalizedContent": "fix the login flow",
        }))
        .unwrap()
    }

    #[test]
    fn title_includes_number_and_summary() {
        assert_eq!(pr_title(&task()), "Push #427: fix login");
    }

    #[test]
    fn long_titles_are_truncated() {
        let mut t = task();
        t.summary = "x".repeat(200);
        let title = pr_title(&t);
        assert!(title.chars().count() <= 72);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn body_mentions_origin() {
        let body = pr_body(&task());
        assert!(body.starts_with("fix the login flow"));
        assert!(body.contains("task #427"));
    }
}
