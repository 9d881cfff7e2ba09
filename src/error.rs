#![forbid(unsafe_code)]

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PushdError {
    #[error("git is required but was not found in PATH")]
    GitNotFound,

    #[error("git {args} timed out after {timeout_secs}s")]
    GitTimeout { args: String, timeout_secs: u64 },

    #[error("config error: {0}")]
    Config(String),

    #[error("no API key configured (set PUSH_API_KEY or run the connect flow)")]
    MissingApiKey,

    #[error("no project registered for {0}")]
    ProjectNotRegistered(String),

    #[error("registered path for {repo_url} does not exist: {path}")]
    ProjectPathMissing { repo_url: String, path: PathBuf },

    #[error("worktree error: {0}")]
    Worktree(String),

    #[error("daemon already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("{0}")]
    Other(String),
}
