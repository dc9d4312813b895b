//! PID file handling.
//!
//! The running process records where it listens so sibling tooling can find
//! it. Readers ignore records whose PID is no longer alive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Contents of `<configDir>/server.pid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PidRecord {
    pub pid: u32,
    pub url: String,
    pub port: u16,
    pub host: String,
    pub transport: String,
    pub started_at: DateTime<Utc>,
    pub config_dir: PathBuf,
}

/// A written PID file, removed on drop.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the record for the current process.
    pub fn write(config_dir: &Path, record: &PidRecord) -> Result<Self, ConfigError> {
        let path = config_dir.join("server.pid");
        let raw = serde_json::to_string_pretty(record)
            .map_err(|e| ConfigError::parse(format!("serialize pid record: {e}")))?;
        std::fs::write(&path, raw)?;
        Ok(Self { path })
    }

    /// Read a record, returning `None` for missing, unparseable, or stale
    /// (dead PID) files.
    pub fn read_live(config_dir: &Path) -> Option<PidRecord> {
        let path = config_dir.join("server.pid");
        let raw = std::fs::read_to_string(path).ok()?;
        let record: PidRecord = serde_json::from_str(&raw).ok()?;
        if pid_alive(record.pid) {
            Some(record)
        } else {
            None
        }
    }

    /// Path of the PID file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove pid file");
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    // No portable liveness probe without a syscall shim; err on the side
    // of treating the record as live.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: u32) -> PidRecord {
        PidRecord {
            pid,
            url: "http://127.0.0.1:3050/mcp".to_string(),
            port: 3050,
            host: "127.0.0.1".to_string(),
            transport: "streamable-http".to_string(),
            started_at: Utc::now(),
            config_dir: PathBuf::from("/tmp"),
        }
    }

    #[test]
    fn write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let pid = std::process::id();
        let file = PidFile::write(dir.path(), &record(pid)).unwrap();
        assert!(file.path().exists());

        let live = PidFile::read_live(dir.path()).expect("current pid is alive");
        assert_eq!(live.pid, pid);

        drop(file);
        assert!(PidFile::read_live(dir.path()).is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn stale_pid_ignored() {
        let dir = tempfile::tempdir().unwrap();
        // PID 0 is never a user process; /proc/0 does not exist.
        let _file = PidFile::write(dir.path(), &record(0)).unwrap();
        assert!(PidFile::read_live(dir.path()).is_none());
    }
}
