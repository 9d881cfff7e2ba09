#![forbid(unsafe_code)]

pub mod machine;
pub mod projects;

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use directories::ProjectDirs;

use crate::error::PushdError;

/// On-disk layout. Config artifacts live under `~/.config/push`, runtime
/// state (pid, log, status) under `~/.push`.
#[derive(Debug, Clone)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl Paths {
    pub fn resolve() -> anyhow::Result<Self> {
        if let (Some(config), Some(state)) = (
            std::env::var_os("PUSH_CONFIG_DIR"),
            std::env::var_os("PUSH_STATE_DIR"),
        ) {
            return Ok(Self {
                config_dir: PathBuf::from(config),
                state_dir: PathBuf::from(state),
            });
        }

        if let Some(home) = home_dir() {
            return Ok(Self {
                config_dir: home.join(".config").join("push"),
                state_dir: home.join(".push"),
            });
        }

        let proj = ProjectDirs::from("com", "push", "push")
            .context("failed to determine platform config directory")?;
        Ok(Self {
            config_dir: proj.config_dir().to_path_buf(),
            state_dir: proj.data_dir().to_path_buf(),
        })
    }

    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config")
    }

    #[must_use]
    pub fn machine_id_file(&self) -> PathBuf {
        self.config_dir.join("machine_id")
    }

    #[must_use]
    pub fn projects_file(&self) -> PathBuf {
        self.config_dir.join("projects.json")
    }

    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join("daemon.pid")
    }

    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join("daemon.log")
    }

    #[must_use]
    pub fn status_file(&self) -> PathBuf {
        self.state_dir.join("daemon_status.json")
    }

    #[must_use]
    pub fn version_file(&self) -> PathBuf {
        self.state_dir.join("daemon.version")
    }

    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        for dir in [&self.config_dir, &self.state_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Daemon settings from the line-oriented `NAME=VALUE` config file.
/// An environment variable with the same name always wins over the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_key: Option<String>,
    pub email: Option<String>,
    pub auto_commit: bool,
    pub auto_merge: bool,
    pub auto_complete: bool,
    pub max_batch_size: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            email: None,
            auto_commit: true,
            auto_merge: true,
            auto_complete: true,
            max_batch_size: 5,
        }
    }
}

impl Settings {
    pub fn load(paths: &Paths) -> anyhow::Result<Self> {
        let file = paths.config_file();
        let raw = if file.exists() {
            std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?
        } else {
            String::new()
        };
        Self::from_config(&raw, |key| std::env::var(key).ok())
    }

    /// Parse from raw file contents plus an environment lookup. Split out so
    /// tests can supply the environment without mutating the process.
    pub fn from_config(
        raw: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let mut file_values = std::collections::BTreeMap::new();
        for line in raw.lines() {
            if let Some((key, value)) = parse_config_line(line) {
                file_values.insert(key, value);
            }
        }

        let get = |key: &str| -> Option<String> {
            env(key)
                .filter(|v| !v.trim().is_empty())
                .or_else(|| file_values.get(key).cloned())
        };

        let defaults = Self::default();
        let settings = Self {
            api_key: get("PUSH_API_KEY"),
            email: get("PUSH_EMAIL"),
            auto_commit: get("PUSH_AUTO_COMMIT")
                .map_or(defaults.auto_commit, |v| parse_flag(&v)),
            auto_merge: get("PUSH_AUTO_MERGE")
                .map_or(defaults.auto_merge, |v| parse_flag(&v)),
            auto_complete: get("PUSH_AUTO_COMPLETE")
                .map_or(defaults.auto_complete, |v| parse_flag(&v)),
            max_batch_size: match get("PUSH_MAX_BATCH_SIZE") {
                Some(v) => v.trim().parse().map_err(|_| {
                    PushdError::Config(format!("PUSH_MAX_BATCH_SIZE must be an integer, got '{v}'"))
                })?,
                None => defaults.max_batch_size,
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), PushdError> {
        if !(1..=20).contains(&self.max_batch_size) {
            return Err(PushdError::Config(
                "PUSH_MAX_BATCH_SIZE must be between 1 and 20".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn require_api_key(&self) -> Result<&str, PushdError> {
        self.api_key.as_deref().ok_or(PushdError::MissingApiKey)
    }
}

/// Accepts both `NAME=VALUE` and shell-style `export NAME="VALUE"` lines;
/// the connect flow historically wrote the latter.
fn parse_config_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    let value = value.trim().trim_matches('"').trim_matches('\'');
    Some((key.to_owned(), value.to_owned()))
}

fn parse_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "off" | "no"
    )
}

pub(crate) fn home_dir() -> Option<PathBuf> {
    if let Some(v) = std::env::var_os("HOME") {
        return Some(PathBuf::from(v));
    }
    if let Some(v) = std::env::var_os("USERPROFILE") {
        return Some(PathBuf::from(v));
    }
    let drive = std::env::var_os("HOMEDRIVE");
    let path = std::env::var_os("HOMEPATH");
    match (drive, path) {
        (Some(d), Some(p)) => Some(PathBuf::from(d).join(PathBuf::from(p))),
        _ => None,
    }
}

/// Write a JSON document via temp-then-rename so readers never observe a
/// partial file.
pub(crate) fn write_json_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}
