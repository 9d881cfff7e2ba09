#![forbid(unsafe_code)]

use std::fmt::Write as _;

use anyhow::Context as _;
use sha2::{Digest as _, Sha256};
use uuid::Uuid;

use crate::config::Paths;

/// Stable per-machine identity. The 8-hex suffix doubles as the worktree
/// suffix embedded in task branch names, so it must never rotate once
/// persisted: branch reuse on re-run depends on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineIdentity {
    pub machine_id: String,
    pub machine_name: String,
    pub suffix: String,
}

impl MachineIdentity {
    pub fn load_or_create(paths: &Paths) -> anyhow::Result<Self> {
        let file = paths.machine_id_file();
        if file.exists() {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            if let Some(identity) = Self::parse(raw.trim()) {
                return Ok(identity);
            }
            tracing::warn!(path = %file.display(), "unparseable machine_id file, regenerating");
        }

        let host = current_hostname();
        let identity = Self::generate(&host);
        paths.ensure_dirs()?;
        std::fs::write(&file, format!("{}\n", identity.machine_id))
            .with_context(|| format!("failed to write {}", file.display()))?;
        Ok(identity)
    }

    #[must_use]
    pub fn generate(host: &str) -> Self {
        let suffix = generate_suffix(host);
        Self {
            machine_id: format!("{host}-{suffix}"),
            machine_name: host.to_owned(),
            suffix,
        }
    }

    #[must_use]
    pub fn parse(machine_id: &str) -> Option<Self> {
        let (name, suffix) = machine_id.rsplit_once('-')?;
        if name.is_empty() || suffix.len() != 8 || !suffix.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self {
            machine_id: machine_id.to_owned(),
            machine_name: name.to_owned(),
            suffix: suffix.to_owned(),
        })
    }
}

fn current_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "unknown-host".to_owned())
}

/// Short hash over hostname plus a random component, rendered as 8 hex chars.
fn generate_suffix(host: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(Uuid::new_v4().as_bytes());
    let digest = hasher.finalize();
    let mut s = String::with_capacity(8);
    for b in &digest[..4] {
        let _ = write!(&mut s, "{b:02x}");
    }
    s
}
