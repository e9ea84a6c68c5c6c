use crate::errors::{ReleaseKitError, Result, io_error_with_path};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Current journal schema version
pub const CURRENT_JOURNAL_VERSION: u32 = 1;

pub const JOURNAL_FILE: &str = ".releasekit/run.json";

/// Per-package publish status recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Pending,
    Pinning,
    Building,
    Publishing,
    Polling,
    Verifying,
    Restoring,
    Done,
    Failed,
    Blocked,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageRecord {
    pub status: PackageStatus,
    pub attempts: u32,
    #[serde(default)]
    pub artifact_hashes: Vec<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One planned bump as persisted in the journal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalBump {
    pub package: String,
    pub from: String,
    pub to: String,
}

/// The per-run state file, written atomically after every per-package
/// state transition so a crashed run can resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub journal_version: u32,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub git_sha: String,
    pub plan_hash: String,
    pub plan: Vec<JournalBump>,
    pub per_package: BTreeMap<String, PackageRecord>,
}

impl RunState {
    pub fn new(run_id: &str, git_sha: &str, plan_hash: &str, plan: Vec<JournalBump>) -> Self {
        Self {
            journal_version: CURRENT_JOURNAL_VERSION,
            run_id: run_id.to_string(),
            started_at: Utc::now(),
            git_sha: git_sha.to_string(),
            plan_hash: plan_hash.to_string(),
            plan,
            per_package: BTreeMap::new(),
        }
    }

    /// Record a per-package transition. Attempts count publish tries.
    pub fn record(&mut self, package: &str, status: PackageStatus) {
        let record = self
            .per_package
            .entry(package.to_string())
            .or_insert(PackageRecord {
                status,
                attempts: 0,
                artifact_hashes: Vec::new(),
                updated_at: Utc::now(),
                error: None,
            });
        if status == PackageStatus::Publishing {
            record.attempts += 1;
        }
        record.status = status;
        record.updated_at = Utc::now();
    }

    pub fn record_error(&mut self, package: &str, error: &str) {
        if let Some(record) = self.per_package.get_mut(package) {
            record.error = Some(error.to_string());
        }
    }

    pub fn record_artifacts(&mut self, package: &str, hashes: Vec<String>) {
        if let Some(record) = self.per_package.get_mut(package) {
            record.artifact_hashes = hashes;
        }
    }

    pub fn status_of(&self, package: &str) -> Option<PackageStatus> {
        self.per_package.get(package).map(|r| r.status)
    }
}

pub fn journal_path(root: &Path) -> PathBuf {
    root.join(JOURNAL_FILE)
}

/// Load the journal if present. An unreadable journal is an error; the
/// caller decides whether to start fresh.
pub fn load(root: &Path) -> Result<Option<RunState>> {
    let path = journal_path(root);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path).map_err(|e| io_error_with_path(e, &path))?;
    let state: RunState = serde_json::from_str(&content)
        .map_err(|e| ReleaseKitError::Journal(format!("failed to parse {}: {e}", path.display())))?;
    if state.journal_version > CURRENT_JOURNAL_VERSION {
        return Err(ReleaseKitError::Journal(format!(
            "journal version {} is newer than supported version {}",
            state.journal_version, CURRENT_JOURNAL_VERSION
        )));
    }
    Ok(Some(state))
}

/// Persist the journal atomically (temp-file + rename): no reader ever
/// sees a torn file.
pub fn save(root: &Path, state: &RunState) -> Result<()> {
    let path = journal_path(root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error_with_path(e, parent))?;
    }
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| ReleaseKitError::Journal(format!("failed to serialize journal: {e}")))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, json).map_err(|e| io_error_with_path(e, &tmp_path))?;
    fs::rename(&tmp_path, &path).map_err(|e| io_error_with_path(e, &path))?;
    Ok(())
}

pub fn clear(root: &Path) -> Result<()> {
    let path = journal_path(root);
    if path.exists() {
        fs::remove_file(&path).map_err(|e| io_error_with_path(e, &path))?;
    }
    Ok(())
}

/// The journal drives a resume only when it describes the same release:
/// same commit, same plan.
pub fn matches_run(state: &RunState, git_sha: &str, plan_hash: &str) -> bool {
    state.git_sha == git_sha && state.plan_hash == plan_hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> RunState {
        RunState::new(
            "run-20260801-1",
            "aaa1111",
            "deadbeef",
            vec![JournalBump {
                package: "core".into(),
                from: "1.0.0".into(),
                to: "1.1.0".into(),
            }],
        )
    }

    #[test]
    fn save_load_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let mut state = sample_state();
        state.record("core", PackageStatus::Building);
        save(temp.path(), &state).unwrap();

        let loaded = load(temp.path()).unwrap().unwrap();
        assert_eq!(loaded.run_id, "run-20260801-1");
        assert_eq!(loaded.status_of("core"), Some(PackageStatus::Building));
        assert_eq!(loaded.plan.len(), 1);
    }

    #[test]
    fn missing_journal_is_none() {
        let temp = tempfile::tempdir().unwrap();
        assert!(load(temp.path()).unwrap().is_none());
    }

    #[test]
    fn publishing_transitions_count_attempts() {
        let mut state = sample_state();
        state.record("core", PackageStatus::Pinning);
        state.record("core", PackageStatus::Publishing);
        state.record("core", PackageStatus::Polling);
        state.record("core", PackageStatus::Publishing);
        assert_eq!(state.per_package["core"].attempts, 2);
    }

    #[test]
    fn resume_requires_matching_sha_and_plan() {
        let state = sample_state();
        assert!(matches_run(&state, "aaa1111", "deadbeef"));
        assert!(!matches_run(&state, "bbb2222", "deadbeef"));
        assert!(!matches_run(&state, "aaa1111", "cafebabe"));
    }

    #[test]
    fn newer_journal_version_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let mut state = sample_state();
        state.journal_version = CURRENT_JOURNAL_VERSION + 1;
        save(temp.path(), &state).unwrap();
        assert!(load(temp.path()).is_err());
    }

    #[test]
    fn clear_removes_journal() {
        let temp = tempfile::tempdir().unwrap();
        save(temp.path(), &sample_state()).unwrap();
        clear(temp.path()).unwrap();
        assert!(load(temp.path()).unwrap().is_none());
    }
}
