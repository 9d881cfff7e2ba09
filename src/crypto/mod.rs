#![forbid(unsafe_code)]

use std::process::Stdio;
use std::time::Duration;

use aes_gcm::aead::Aead as _;
use aes_gcm::{Aes256Gcm, Key, KeyInit as _, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::task::model::Task;

/// Default keychain helper binary; overridable for packaging layouts.
const HELPER_ENV: &str = "PUSH_KEYCHAIN_HELPER";
const DEFAULT_HELPER: &str = "push-keychain";
const HELPER_TIMEOUT: Duration = Duration::from_secs(10);

/// Wire format of an encrypted field: version(1) || nonce(12) || ct || tag(16),
/// base64-encoded. Only version 0 is recognized.
const WIRE_VERSION: u8 = 0;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Decrypts selected task fields when a key is available. Without a key
/// (helper absent, platform without a keychain) every field passes through
/// unchanged and stays opaque.
#[derive(Clone, Default)]
pub struct Decryptor {
    cipher: Option<Aes256Gcm>,
}

impl std::fmt::Debug for Decryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decryptor")
            .field("key_loaded", &self.cipher.is_some())
            .finish()
    }
}

impl Decryptor {
    /// Fetch the symmetric key once per process from the keychain helper.
    pub async fn init() -> Self {
        match fetch_key().await {
            Some(key) => {
                tracing::info!("decryption key loaded from keychain helper");
                Self { cipher: Some(key) }
            }
            None => {
                tracing::debug!("no keychain helper available, encrypted fields stay opaque");
                Self::default()
            }
        }
    }

    #[must_use]
    pub fn from_key_bytes(key: &[u8]) -> Self {
        let cipher = (key.len() == 32)
            .then(|| Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)));
        Self { cipher }
    }

    #[must_use]
    pub fn has_key(&self) -> bool {
        self.cipher.is_some()
    }

    /// Decrypt one base64 field. Any failure returns the original value.
    #[must_use]
    pub fn decrypt(&self, value: &str) -> String {
        match self.try_decrypt(value) {
            Some(plaintext) => plaintext,
            None => value.to_owned(),
        }
    }

    fn try_decrypt(&self, value: &str) -> Option<String> {
        let cipher = self.cipher.as_ref()?;
        let raw = STANDARD.decode(value.trim()).ok()?;
        if raw.len() < 1 + NONCE_LEN + TAG_LEN {
            return None;
        }
        let (&version, rest) = raw.split_first()?;
        if version != WIRE_VERSION {
            return None;
        }
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let plaintext = cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()?;
        String::from_utf8(plaintext).ok()
    }

    /// Decrypt the protected fields of a task flagged as encrypted.
    pub fn decrypt_task(&self, task: &mut Task) {
        if !task.encrypted {
            return;
        }
        task.summary = self.decrypt(&task.summary);
        task.content = self.decrypt(&task.content);
        if let Some(transcript) = task.original_transcript.take() {
            task.original_transcript = Some(self.decrypt(&transcript));
        }
    }
}

fn helper_binary() -> String {
    std::env::var(HELPER_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HELPER.to_owned())
}

/// Probe the helper with `--check`, then ask it for the base64 key.
async fn fetch_key() -> Option<Aes256Gcm> {
    let helper = helper_binary();

    let check = tokio::time::timeout(
        HELPER_TIMEOUT,
        tokio::process::Command::new(&helper)
            .arg("--check")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status(),
    )
    .await;
    match check {
        Ok(Ok(status)) if status.success() => {}
        _ => return None,
    }

    let output = tokio::time::timeout(
        HELPER_TIMEOUT,
        tokio::process::Command::new(&helper)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output(),
    )
    .await;
    let output = match output {
        Ok(Ok(out)) if out.status.success() => out,
        _ => return None,
    };

    let encoded = String::from_utf8(output.stdout).ok()?;
    let key = STANDARD.decode(encoded.trim()).ok()?;
    if key.len() != 32 {
        tracing::warn!(len = key.len(), "keychain helper returned a key of unexpected length");
        return None;
    }
    Some(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)))
}
