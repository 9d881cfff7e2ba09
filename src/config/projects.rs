#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::config::{Paths, write_json_atomic};

const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEntry {
    pub local_path: String,
    pub registered_at: String,
    pub last_used: Option<String>,
}

/// Mapping of canonical repo URL (`host/owner/name`) to local checkout.
/// Exactly one path per URL; re-registering replaces the entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRegistry {
    pub version: u32,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectEntry>,
    #[serde(default)]
    pub default_project: Option<String>,
}

impl Default for ProjectRegistry {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            projects: BTreeMap::new(),
            default_project: None,
        }
    }
}

impl ProjectRegistry {
    /// A corrupt registry is treated as empty and rewritten on next save.
    pub fn load(paths: &Paths) -> Self {
        let file = paths.projects_file();
        if !file.exists() {
            return Self::default();
        }
        match std::fs::read(&file) {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(registry) => registry,
                Err(e) => {
                    tracing::warn!(path = %file.display(), error = %e, "corrupt projects.json, starting empty");
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(path = %file.display(), error = %e, "unreadable projects.json, starting empty");
                Self::default()
            }
        }
    }

    pub fn save(&self, paths: &Paths) -> anyhow::Result<()> {
        let data = serde_json::to_vec_pretty(self).context("failed to serialize projects.json")?;
        write_json_atomic(&paths.projects_file(), &data)
    }

    pub fn register(&mut self, repo_url: &str, local_path: &Path) {
        let entry = ProjectEntry {
            local_path: local_path.to_string_lossy().into_owned(),
            registered_at: now_rfc3339(),
            last_used: None,
        };
        self.projects.insert(repo_url.to_owned(), entry);
        if self.default_project.is_none() {
            self.default_project = Some(repo_url.to_owned());
        }
    }

    /// Read-only lookup; does not bump `last_used`.
    #[must_use]
    pub fn local_path(&self, repo_url: &str) -> Option<PathBuf> {
        self.projects
            .get(repo_url)
            .map(|e| PathBuf::from(&e.local_path))
    }

    /// Execute-path lookup: marks the project as used.
    pub fn touch_last_used(&mut self, repo_url: &str) {
        if let Some(entry) = self.projects.get_mut(repo_url) {
            entry.last_used = Some(now_rfc3339());
        }
    }

    #[must_use]
    pub fn registered_urls(&self) -> Vec<String> {
        self.projects.keys().cloned().collect()
    }
}

/// Normalize any git remote form to canonical `host/owner/name`:
/// no scheme, no `.git`, scp-style `git@host:owner/name` folded in.
#[must_use]
pub fn normalize_repo_url(remote: &str) -> Option<String> {
    let remote = remote.trim();
    if remote.is_empty() {
        return None;
    }

    if let Some(rest) = remote.strip_prefix("git@") {
        let (host, path) = rest.split_once(':')?;
        return join_canonical(host, path);
    }

    let re = Regex::new(r"^(?:(?:https?)|ssh)://(?:git@)?([^/]+)/(.+)$").ok()?;
    if let Some(caps) = re.captures(remote) {
        return join_canonical(&caps[1], &caps[2]);
    }

    // Already canonical: host/owner/name
    let mut parts = remote.trim_matches('/').splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(host), Some(owner), Some(name)) if host.contains('.') => {
            join_canonical(host, &format!("{owner}/{name}"))
        }
        _ => None,
    }
}

fn join_canonical(host: &str, path: &str) -> Option<String> {
    let mut parts = path.trim_matches('/').split('/');
    let owner = parts.next()?;
    let name_raw = parts.next()?;
    let name = name_raw.strip_suffix(".git").unwrap_or(name_raw);
    if owner.is_empty() || name.is_empty() {
        return None;
    }
    Some(format!("{host}/{owner}/{name}"))
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_remote_forms() {
        for remote in [
            "https://github.com/u/r.git",
            "http://github.com/u/r",
            "git@github.com:u/r.git",
            "ssh://git@github.com/u/r.git",
            "github.com/u/r",
        ] {
            assert_eq!(
                normalize_repo_url(remote).as_deref(),
                Some("github.com/u/r"),
                "remote form: {remote}"
            );
        }
        assert!(normalize_repo_url("not a url").is_none());
        assert!(normalize_repo_url("").is_none());
    }

    #[test]
    fn register_and_lookup() {
        let mut reg = ProjectRegistry::default();
        reg.register("github.com/u/r", Path::new("/src/r"));
        assert_eq!(
            reg.local_path("github.com/u/r"),
            Some(PathBuf::from("/src/r"))
        );
        assert_eq!(reg.default_project.as_deref(), Some("github.com/u/r"));
        assert!(reg.local_path("github.com/u/other").is_none());

        // Re-registering replaces the path.
        reg.register("github.com/u/r", Path::new("/code/r"));
        assert_eq!(
            reg.local_path("github.com/u/r"),
            Some(PathBuf::from("/code/r"))
        );
        assert_eq!(reg.projects.len(), 1);
    }

    #[test]
    fn touch_only_on_execute_path() {
        let mut reg = ProjectRegistry::default();
        reg.register("github.com/u/r", Path::new("/src/r"));
        assert!(reg.projects["github.com/u/r"].last_used.is_none());

        let _ = reg.local_path("github.com/u/r");
        assert!(reg.projects["github.com/u/r"].last_used.is_none());

        reg.touch_last_used("github.com/u/r");
        assert!(reg.projects["github.com/u/r"].last_used.is_some());
    }

    #[test]
    fn save_and_reload_round_trip() {
        let td = tempfile::tempdir().expect("tempdir");
        let paths = Paths {
            config_dir: td.path().join("config"),
            state_dir: td.path().join("state"),
        };
        let mut reg = ProjectRegistry::default();
        reg.register("github.com/u/r", Path::new("/src/r"));
        reg.save(&paths).unwrap();

        let loaded = ProjectRegistry::load(&paths);
        assert_eq!(loaded, reg);
    }

    #[test]
    fn corrupt_registry_treated_as_empty() {
        let td = tempfile::tempdir().expect("tempdir");
        let paths = Paths {
            config_dir: td.path().join("config"),
            state_dir: td.path().join("state"),
        };
        std::fs::create_dir_all(&paths.config_dir).unwrap();
        std::fs::write(paths.projects_file(), b"{ not json").unwrap();

        let loaded = ProjectRegistry::load(&paths);
        assert!(loaded.projects.is_empty());
    }
}
