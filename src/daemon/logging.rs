#![forbid(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

pub const LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const LOG_BACKUPS: usize = 3;

/// Line-oriented log file, rotated by size: `daemon.log` -> `daemon.log.1`
/// ... up to the backup count, oldest dropped.
#[derive(Debug)]
pub struct RotatingWriter {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: File,
    written: u64,
}

impl RotatingWriter {
    pub fn open(path: PathBuf, max_bytes: u64, backups: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_bytes,
            backups,
            file,
            written,
        })
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.file.flush()?;
        for i in (1..self.backups).rev() {
            let from = self.backup_path(i);
            if from.exists() {
                let _ = std::fs::rename(&from, self.backup_path(i + 1));
            }
        }
        let _ = std::fs::rename(&self.path, self.backup_path(1));
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }

    fn backup_path(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

/// Cloneable writer handle for the tracing subscriber; mirrors to stderr
/// when the daemon runs in the foreground.
#[derive(Clone)]
pub struct LogHandle {
    inner: Arc<Mutex<RotatingWriter>>,
    mirror_stderr: bool,
}

impl Write for LogHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.mirror_stderr {
            let _ = std::io::stderr().write_all(buf);
        }
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

/// Install the daemon subscriber: rotating file writer, `PUSH_LOG` filter
/// (default `info`), no ANSI.
pub fn init_daemon(log_path: PathBuf, mirror_stderr: bool) -> anyhow::Result<()> {
    let writer = RotatingWriter::open(log_path.clone(), LOG_MAX_BYTES, LOG_BACKUPS)
        .with_context(|| format!("failed to open {}", log_path.display()))?;
    let handle = LogHandle {
        inner: Arc::new(Mutex::new(writer)),
        mirror_stderr,
    };
    let filter = EnvFilter::try_from_env("PUSH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false)
        .with_writer(move || handle.clone())
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;
    Ok(())
}

/// Stderr-only subscriber for the control commands.
pub fn init_console() {
    let filter = EnvFilter::try_from_env("PUSH_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_when_size_exceeded() {
        let td = tempfile::tempdir().expect("tempdir");
        let path = td.path().join("daemon.log");
        let mut writer = RotatingWriter::open(path.clone(), 64, 3).unwrap();

        for i in 0..12 {
            writeln!(writer, "log line number {i:04} with padding").unwrap();
        }
        writer.flush().unwrap();

        assert!(path.exists());
        assert!(td.path().join("daemon.log.1").exists());
        assert!(std::fs::metadata(&path).unwrap().len() <= 64);
    }

    #[test]
    fn keeps_at_most_the_backup_count() {
        let td = tempfile::tempdir().expect("tempdir");
        let path = td.path().join("daemon.log");
        let mut writer = RotatingWriter::open(path.clone(), 32, 3).unwrap();

        for i in 0..40 {
            writeln!(writer, "line {i:04} aaaaaaaaaaaaaaaa").unwrap();
        }
        writer.flush().unwrap();

        assert!(td.path().join("daemon.log.1").exists());
        assert!(td.path().join("daemon.log.2").exists());
        assert!(td.path().join("daemon.log.3").exists());
        assert!(!td.path().join("daemon.log.4").exists());
    }
}
