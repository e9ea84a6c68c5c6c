use crate::backends::registry::hex_sha256;
use crate::errors::{ReleaseKitError, Result, io_error_with_path};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

const INDEX_FILE: &str = "index.json";

/// One pinned file: its sidecar backup location and the hash of the
/// pre-mutation content, kept to verify the restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PinnedFile {
    path: PathBuf,
    backup_path: PathBuf,
    original_sha256: String,
}

/// A scoped set of ephemeral manifest mutations with guaranteed
/// restoration.
///
/// Every mutation writes a sidecar backup under a per-run directory before
/// touching the original. Restoration is idempotent (guarded by a flag),
/// runs on normal release, on Drop as the last resort, and on the signal
/// path through the process-wide session registry. Concurrent publish
/// tasks must each hold their own session and never mutate the same file;
/// the publisher enforces that scoping.
pub struct PinSession {
    backup_dir: PathBuf,
    pinned: Mutex<BTreeMap<PathBuf, PinnedFile>>,
    restored: AtomicBool,
}

impl PinSession {
    /// Open a session with backups under `<root>/.releasekit/backups/<scope>`.
    pub fn new(root: &Path, scope: &str) -> Result<Arc<Self>> {
        let backup_dir = root.join(".releasekit").join("backups").join(scope);
        fs::create_dir_all(&backup_dir).map_err(|e| io_error_with_path(e, &backup_dir))?;
        let session = Arc::new(Self {
            backup_dir,
            pinned: Mutex::new(BTreeMap::new()),
            restored: AtomicBool::new(false),
        });
        register_session(&session);
        Ok(session)
    }

    /// Apply one mutation: back the file up (first mutation of a path only)
    /// and atomically write the new content.
    pub fn mutate(&self, path: &Path, new_content: &str) -> Result<()> {
        if self.restored.load(Ordering::SeqCst) {
            return Err(ReleaseKitError::PinIntegrity(format!(
                "session already restored; refusing to mutate {}",
                path.display()
            )));
        }

        let mut pinned = self.pinned.lock().expect("pin registry poisoned");
        if !pinned.contains_key(path) {
            let original = fs::read_to_string(path).map_err(|e| io_error_with_path(e, path))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "manifest".to_string());
            let backup_path = self
                .backup_dir
                .join(format!("{}-{}.bak", pinned.len(), file_name));
            fs::write(&backup_path, &original)
                .map_err(|e| io_error_with_path(e, &backup_path))?;
            pinned.insert(
                path.to_path_buf(),
                PinnedFile {
                    path: path.to_path_buf(),
                    backup_path,
                    original_sha256: hex_sha256(original.as_bytes()),
                },
            );
            // Keep the on-disk index current so a successor process can
            // restore after a crash.
            let index: Vec<&PinnedFile> = pinned.values().collect();
            let json = serde_json::to_string_pretty(&index).map_err(|e| {
                ReleaseKitError::PinIntegrity(format!("failed to serialize backup index: {e}"))
            })?;
            let index_path = self.backup_dir.join(INDEX_FILE);
            fs::write(&index_path, json).map_err(|e| io_error_with_path(e, &index_path))?;
        }
        drop(pinned);

        atomic_write(path, new_content)
    }

    /// Number of files currently pinned by this session.
    pub fn pinned_count(&self) -> usize {
        self.pinned.lock().expect("pin registry poisoned").len()
    }

    /// Restore every pinned file from its backup. Idempotent: the second
    /// and later calls are no-ops. On success the backup directory is
    /// removed.
    ///
    /// A missing backup or a backup whose content no longer matches the
    /// recorded pre-mutation hash is a pin-integrity failure (exit 3):
    /// the worktree needs human repair before any further run.
    pub fn restore_all(&self) -> Result<()> {
        if self.restored.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let pinned = self.pinned.lock().expect("pin registry poisoned");
        let mut first_error = None;
        for file in pinned.values() {
            if let Err(err) = restore_one(file) {
                // Keep restoring the remaining files; report the first failure.
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        drop(pinned);

        match first_error {
            Some(err) => Err(err),
            None => {
                let _ = fs::remove_dir_all(&self.backup_dir);
                Ok(())
            }
        }
    }
}

impl Drop for PinSession {
    fn drop(&mut self) {
        // Last-resort synchronous restore when the loop died before release.
        let _ = self.restore_all();
    }
}

fn restore_one(file: &PinnedFile) -> Result<()> {
    if !file.backup_path.exists() {
        return Err(ReleaseKitError::PinIntegrity(format!(
            "backup missing for {} (expected {})",
            file.path.display(),
            file.backup_path.display()
        )));
    }
    let backup = fs::read_to_string(&file.backup_path)
        .map_err(|e| io_error_with_path(e, &file.backup_path))?;
    if hex_sha256(backup.as_bytes()) != file.original_sha256 {
        return Err(ReleaseKitError::PinIntegrity(format!(
            "backup for {} does not match the pre-mutation checksum",
            file.path.display()
        )));
    }
    atomic_write(&file.path, &backup)
}

/// Write-temp + rename so no reader ever sees a half-written manifest.
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("releasekit-tmp");
    fs::write(&tmp_path, content).map_err(|e| io_error_with_path(e, &tmp_path))?;
    fs::rename(&tmp_path, path).map_err(|e| io_error_with_path(e, path))?;
    Ok(())
}

// Process-wide registry of live sessions, consulted by the cancellation
// path so a dying run restores everything it pinned.
static ACTIVE_SESSIONS: OnceLock<Mutex<Vec<Weak<PinSession>>>> = OnceLock::new();

fn sessions() -> &'static Mutex<Vec<Weak<PinSession>>> {
    ACTIVE_SESSIONS.get_or_init(|| Mutex::new(Vec::new()))
}

fn register_session(session: &Arc<PinSession>) {
    let mut list = sessions().lock().expect("session registry poisoned");
    list.retain(|weak| weak.strong_count() > 0);
    list.push(Arc::downgrade(session));
}

/// Restore every live session. Called from the cancellation path after the
/// signal handler has requested shutdown; returns the first failure.
pub fn restore_all_registered() -> Result<()> {
    let list = {
        let mut guard = sessions().lock().expect("session registry poisoned");
        guard.retain(|weak| weak.strong_count() > 0);
        guard.clone()
    };
    let mut first_error = None;
    for weak in list {
        if let Some(session) = weak.upgrade() {
            if let Err(err) = session.restore_all() {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Restore every backup recorded on disk under
/// `<root>/.releasekit/backups/`, for recovery after a crashed process.
/// Returns the number of files restored.
pub fn restore_from_disk(root: &Path) -> Result<usize> {
    let backups_root = root.join(".releasekit").join("backups");
    if !backups_root.exists() {
        return Ok(0);
    }

    let mut restored = 0;
    let mut first_error = None;
    for entry in walk_index_files(&backups_root)? {
        let content = fs::read_to_string(&entry).map_err(|e| io_error_with_path(e, &entry))?;
        let index: Vec<PinnedFile> = serde_json::from_str(&content).map_err(|e| {
            ReleaseKitError::PinIntegrity(format!("unreadable backup index {}: {e}", entry.display()))
        })?;
        for file in &index {
            match restore_one(file) {
                Ok(()) => restored += 1,
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => {
            let _ = fs::remove_dir_all(&backups_root);
            Ok(restored)
        }
    }
}

fn walk_index_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current).map_err(|e| io_error_with_path(e, &current))? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().and_then(|n| n.to_str()) == Some(INDEX_FILE) {
                out.push(path);
            }
        }
    }
    Ok(out)
}
