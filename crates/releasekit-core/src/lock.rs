use crate::errors::{ReleaseKitError, Result, io_error_with_path};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const LOCK_FILE: &str = ".releasekit/lock";

/// Default staleness horizon for a lock left behind by a crashed run.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30 * 60);

/// Information stored in the lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    /// The command that acquired the lock, for diagnostics.
    pub command: String,
}

/// Advisory process lock with exclusive-create semantics.
///
/// One holder per workspace root. Acquisition fails while a fresh lock is
/// present; a stale lock (older than the timeout) or any lock under
/// `--force-lock` is stolen with a warning. Released on Drop.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
}

impl ProcessLock {
    pub fn lock_path(root: &Path) -> PathBuf {
        root.join(LOCK_FILE)
    }

    /// Acquire the lock, stealing stale or (with `force`) fresh locks.
    pub fn acquire(root: &Path, command: &str, stale_after: Duration, force: bool) -> Result<Self> {
        let path = Self::lock_path(root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error_with_path(e, parent))?;
        }

        if path.exists() {
            match read_lock_info(&path) {
                Ok(existing) => {
                    let age = Utc::now() - existing.started_at;
                    let stale = age.num_seconds().unsigned_abs() > stale_after.as_secs();
                    if force {
                        eprintln!(
                            "Warning: stealing lock held by pid {} on {} since {} (--force-lock)",
                            existing.pid, existing.hostname, existing.started_at
                        );
                    } else if stale {
                        eprintln!(
                            "Warning: removing stale lock held by pid {} on {} since {}",
                            existing.pid, existing.hostname, existing.started_at
                        );
                    } else {
                        return Err(ReleaseKitError::Lock(format!(
                            "another release is in progress: pid {} on {} since {} (command: {})",
                            existing.pid, existing.hostname, existing.started_at, existing.command
                        )));
                    }
                    fs::remove_file(&path).map_err(|e| io_error_with_path(e, &path))?;
                }
                Err(_) => {
                    // Corrupt lock file from a crashed predecessor.
                    eprintln!("Warning: removing unreadable lock file {}", path.display());
                    fs::remove_file(&path).map_err(|e| io_error_with_path(e, &path))?;
                }
            }
        }

        let info = LockInfo {
            pid: std::process::id(),
            hostname: hostname(),
            started_at: Utc::now(),
            command: command.to_string(),
        };
        let json = serde_json::to_string_pretty(&info)
            .map_err(|e| ReleaseKitError::Lock(format!("failed to serialize lock info: {e}")))?;

        // Exclusive create: losing a race to another process fails here.
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                ReleaseKitError::Lock(format!(
                    "failed to create lock file {}: {e}",
                    path.display()
                ))
            })?;
        file.write_all(json.as_bytes())
            .map_err(|e| io_error_with_path(e, &path))?;
        file.sync_all().map_err(ReleaseKitError::Io)?;

        Ok(Self { path })
    }

    pub fn is_locked(root: &Path) -> bool {
        Self::lock_path(root).exists()
    }

    pub fn read_info(root: &Path) -> Result<LockInfo> {
        read_lock_info(&Self::lock_path(root))
    }

    pub fn release(&mut self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| io_error_with_path(e, &self.path))?;
        }
        Ok(())
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn read_lock_info(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path).map_err(|e| io_error_with_path(e, path))?;
    serde_json::from_str(&content)
        .map_err(|e| ReleaseKitError::Lock(format!("failed to parse lock file: {e}")))
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_and_release_removes() {
        let temp = tempfile::tempdir().unwrap();
        let mut lock =
            ProcessLock::acquire(temp.path(), "publish", DEFAULT_STALE_AFTER, false).unwrap();
        assert!(ProcessLock::is_locked(temp.path()));

        let info = ProcessLock::read_info(temp.path()).unwrap();
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.command, "publish");

        lock.release().unwrap();
        assert!(!ProcessLock::is_locked(temp.path()));
    }

    #[test]
    fn fresh_lock_blocks_second_acquire() {
        let temp = tempfile::tempdir().unwrap();
        let _lock =
            ProcessLock::acquire(temp.path(), "publish", DEFAULT_STALE_AFTER, false).unwrap();
        let err = ProcessLock::acquire(temp.path(), "publish", DEFAULT_STALE_AFTER, false)
            .unwrap_err();
        assert!(err.to_string().contains("another release is in progress"));
    }

    #[test]
    fn stale_lock_is_stolen() {
        let temp = tempfile::tempdir().unwrap();
        let path = ProcessLock::lock_path(temp.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let old = LockInfo {
            pid: 1234,
            hostname: "elsewhere".into(),
            started_at: Utc::now() - chrono::Duration::hours(2),
            command: "publish".into(),
        };
        fs::write(&path, serde_json::to_string(&old).unwrap()).unwrap();

        let _lock =
            ProcessLock::acquire(temp.path(), "publish", DEFAULT_STALE_AFTER, false).unwrap();
        let info = ProcessLock::read_info(temp.path()).unwrap();
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn force_steals_fresh_lock() {
        let temp = tempfile::tempdir().unwrap();
        let path = ProcessLock::lock_path(temp.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let fresh = LockInfo {
            pid: 1234,
            hostname: "elsewhere".into(),
            started_at: Utc::now(),
            command: "publish".into(),
        };
        fs::write(&path, serde_json::to_string(&fresh).unwrap()).unwrap();

        let _lock =
            ProcessLock::acquire(temp.path(), "publish", DEFAULT_STALE_AFTER, true).unwrap();
        assert_eq!(
            ProcessLock::read_info(temp.path()).unwrap().pid,
            std::process::id()
        );
    }

    #[test]
    fn corrupt_lock_is_removed() {
        let temp = tempfile::tempdir().unwrap();
        let path = ProcessLock::lock_path(temp.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not json").unwrap();

        let _lock =
            ProcessLock::acquire(temp.path(), "publish", DEFAULT_STALE_AFTER, false).unwrap();
        assert!(ProcessLock::read_info(temp.path()).is_ok());
    }

    #[test]
    fn drop_releases() {
        let temp = tempfile::tempdir().unwrap();
        {
            let _lock =
                ProcessLock::acquire(temp.path(), "publish", DEFAULT_STALE_AFTER, false).unwrap();
            assert!(ProcessLock::is_locked(temp.path()));
        }
        assert!(!ProcessLock::is_locked(temp.path()));
    }
}
